pub mod binlog_pos;
pub mod grant;
pub mod guard;
pub mod metadata;
pub mod mydumper;
pub mod myloader;
pub mod mysql_defaults;
pub mod mysql_loader;
pub mod mysql_service;
pub mod mysqldump;
pub mod physical_loader;
pub mod repair;
pub mod rocksdb;
pub mod tokudb;
pub mod xtrabackup;
