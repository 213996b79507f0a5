use std::path::PathBuf;
use chrono::Local;
use log::{debug, info, warn};
use uuid::Uuid;
use crate::config::{BackupConfig, BackupType, DataSchemaGrant, Switch};
use crate::context::TaskContext;
use crate::error::{BackupError, Result};
use crate::index::{BinlogStatus, IndexContent};
use crate::runner::MyExec;
use crate::service::mysql::grant::GrantDumper;
use crate::service::mysql::mydumper::MydumperDumper;
use crate::service::mysql::mysql_service::MySQLService;
use crate::service::mysql::mysqldump::MysqldumpDumper;
use crate::service::mysql::rocksdb::RocksdbDumper;
use crate::service::mysql::tokudb::TokudbDumper;
use crate::service::mysql::xtrabackup::XtrabackupDumper;
use crate::service::service::{DumpTarget, Dumper};
use crate::utils::{free_space, get_size, target_name};
use crate::version::{parse_glibc_version, MysqlVersion};

/// Above this data size `backup_type=auto` picks physical.
pub const PHYSICAL_SIZE_THRESHOLD: u64 = 400 * 1024 * 1024 * 1024;
pub const LOGICAL_SPACE_RATIO: f64 = 0.6;
pub const PHYSICAL_SPACE_RATIO: f64 = 1.2;
const MIN_GLIBC_FOR_80: (u32, u32) = (2, 14);

/// What the planner learned about the instance and the host.
#[derive(Debug, Clone)]
pub struct InstanceFacts {
    pub version: MysqlVersion,
    pub storage_engine: String,
    pub log_bin_enabled: bool,
    pub data_size: u64,
    pub glibc: Option<(u32, u32)>,
    pub charsets: Vec<String>,
}

impl InstanceFacts {
    /// MySQL 8.0 tools do not run on glibc older than 2.14.
    pub fn needs_new_glibc(&self) -> bool {
        let old_glibc = self.glibc.map(|glibc| glibc < MIN_GLIBC_FOR_80).unwrap_or(false);
        self.version.at_least(8, 0, 0) && old_glibc
    }
}

fn is_special_engine(engine: &str) -> bool {
    engine.eq_ignore_ascii_case("ROCKSDB") || engine.eq_ignore_ascii_case("TOKUDB")
}

pub fn resolve_backup_type(requested: BackupType, dsg: &DataSchemaGrant, facts: &InstanceFacts) -> Result<BackupType> {
    if !dsg.data {
        if requested == BackupType::Physical {
            info!("data_schema_grant={} has no data, backup type forced to logical", dsg);
        }
        return Ok(BackupType::Logical);
    }
    let physical = match requested {
        BackupType::Logical => false,
        BackupType::Physical => true,
        BackupType::Auto => is_special_engine(&facts.storage_engine) || facts.data_size > PHYSICAL_SIZE_THRESHOLD,
    };
    if physical && facts.needs_new_glibc() {
        warn!("glibc too old for physical backup of {}, using logical", facts.version);
        return Ok(BackupType::Logical);
    }
    Ok(if physical { BackupType::Physical } else { BackupType::Logical })
}

/// `charsets` holds the server default first, then every user schema's.
pub fn resolve_charset(requested: &str, backup_type: BackupType, dsg: &DataSchemaGrant, charsets: &[String]) -> String {
    if !requested.is_empty() && !requested.eq_ignore_ascii_case("auto") {
        return requested.to_string();
    }
    if backup_type == BackupType::Physical || !dsg.data {
        return "binary".to_string();
    }
    let mut distinct: Vec<&str> = Vec::new();
    for charset in charsets {
        if !distinct.contains(&charset.as_str()) {
            distinct.push(charset);
        }
    }
    if distinct.iter().all(|c| *c == "utf8" || *c == "utf8mb4" || *c == "utf8mb3") {
        return "utf8mb4".to_string();
    }
    if distinct.len() >= 3 {
        return "binary".to_string();
    }
    distinct[0].to_string()
}

/// mydumper is the default; `auto` falls back to mysqldump where mydumper cannot run.
pub fn resolve_use_mysqldump(switch: Switch, facts: &InstanceFacts) -> bool {
    switch.resolve(facts.needs_new_glibc())
}

pub fn resolve_backup_client(switch: Switch, is_standby: bool) -> bool {
    switch.resolve(is_standby)
}

pub fn required_space(data_size: u64, backup_type: BackupType) -> u64 {
    let ratio = match backup_type {
        BackupType::Physical => PHYSICAL_SPACE_RATIO,
        _ => LOGICAL_SPACE_RATIO,
    };
    (data_size as f64 * ratio) as u64
}

pub fn check_disk_space(free: u64, data_size: u64, backup_type: BackupType) -> Result<()> {
    let need = required_space(data_size, backup_type);
    if free <= need {
        return Err(BackupError::precheck(format!(
            "disk space not enough: need {} bytes, free {} bytes",
            need, free
        )));
    }
    Ok(())
}

/// Sum of the first column of `du -sb` output.
pub fn parse_du_output(output: &str) -> u64 {
    output
        .lines()
        .filter_map(|l| l.split_whitespace().next())
        .filter_map(|n| n.parse::<u64>().ok())
        .sum()
}

async fn data_size(dirs: &[PathBuf], ctx: &TaskContext) -> Result<u64> {
    if dirs.is_empty() {
        return Ok(0);
    }
    let du = MyExec::new("du", "du").arg("-sb").args(dirs.iter().map(|d| d.to_string_lossy().into_owned()));
    match du.run(ctx).await {
        Ok(out) => Ok(parse_du_output(&out.stdout_str())),
        Err(e) => {
            warn!("du failed: {}, walking data dirs instead", e);
            let mut total = 0;
            for dir in dirs {
                total += get_size(dir).unwrap_or(0);
            }
            Ok(total)
        }
    }
}

async fn glibc_version(ctx: &TaskContext) -> Option<(u32, u32)> {
    match MyExec::new("ldd", "ldd").arg("--version").allow_failure().run(ctx).await {
        Ok(out) => match parse_glibc_version(&out.stdout_str()) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!("{}", e);
                None
            }
        },
        Err(e) => {
            warn!("ldd --version: {}", e);
            None
        }
    }
}

pub async fn inspect(db: &MySQLService, ctx: &TaskContext) -> Result<InstanceFacts> {
    let version = db.version().await?;
    let storage_engine = db.storage_engine().await?;
    let log_bin_enabled = db.log_bin_enabled().await?;
    let init_connect = db.init_connect().await?;
    debug!("init_connect: '{}'", init_connect);
    let glibc = glibc_version(ctx).await;
    let dirs = db.data_dirs().await?;
    let data_size = data_size(&dirs, ctx).await?;
    let charsets = db.server_charsets().await?;
    info!(
        "instance {}:{} version {} engine {} data size {} bytes",
        db.host, db.port, version, storage_engine, data_size
    );
    Ok(InstanceFacts {
        version,
        storage_engine,
        log_bin_enabled,
        data_size,
        glibc,
        charsets,
    })
}

/// The resolved task: final config, empty index and the chosen dumper.
pub struct Plan {
    pub cnf: BackupConfig,
    pub facts: InstanceFacts,
    pub target: DumpTarget,
    pub index: IndexContent,
    pub dumper: Box<dyn Dumper>,
    pub backup_client: bool,
}

pub fn choose_dumper(cnf: &BackupConfig, db: &MySQLService, facts: &InstanceFacts, target: DumpTarget) -> Box<dyn Dumper> {
    let public = &cnf.public;
    let engine = facts.storage_engine.as_str();
    if public.data_schema_grant.is_grant_only() {
        return Box::new(GrantDumper::new(db.clone(), target));
    }
    match public.backup_type {
        BackupType::Physical if engine.eq_ignore_ascii_case("ROCKSDB") => Box::new(RocksdbDumper::new(cnf, target)),
        BackupType::Physical if engine.eq_ignore_ascii_case("TOKUDB") => {
            Box::new(TokudbDumper::new(cnf, db.clone(), target))
        }
        BackupType::Physical => Box::new(XtrabackupDumper::new(cnf, db.clone(), target)),
        _ if resolve_use_mysqldump(cnf.logical_backup.use_mysqldump, facts) => {
            Box::new(MysqldumpDumper::new(cnf, db.clone(), target))
        }
        _ => Box::new(MydumperDumper::new(cnf, target)),
    }
}

/// Build the index every later stage fills in.
pub async fn new_index(cnf: &BackupConfig, db: &MySQLService, facts: &InstanceFacts) -> Result<IndexContent> {
    let public = &cnf.public;
    let backup_id = if public.backup_id.is_empty() {
        Uuid::now_v7().to_string()
    } else {
        public.backup_id.clone()
    };
    let mut index = IndexContent::new(
        backup_id,
        public.host.clone(),
        public.port,
        public.role.clone(),
        public.backup_type,
        public.data_schema_grant,
    );
    index.bill_id = public.bill_id.clone();
    index.cluster_id = public.cluster_id;
    index.cluster_address = public.cluster_address.clone();
    index.shard_value = public.shard_value;
    index.bk_biz_id = public.bk_biz_id;
    index.bk_cloud_id = public.bk_cloud_id;
    index.mysql_version = facts.version.raw.clone();
    index.storage_engine = facts.storage_engine.clone();
    index.backup_charset = public.charset.clone();
    index.file_retention_tag = cnf.backup_client.file_tag.clone();
    index.backup_dir = public.backup_dir.to_string_lossy().into_owned();
    index.target_name = public.target_name.clone();
    let (sql_mode, binlog_format, binlog_row_image, time_zone) = db.session_facts().await?;
    index.sql_mode = sql_mode;
    index.binlog_format = binlog_format;
    index.binlog_row_image = binlog_row_image;
    index.time_zone = time_zone;

    if public.role.is_replica() {
        let upstream = db
            .slave_status()
            .await?
            .ok_or_else(|| BackupError::precheck(format!("role is {} but SHOW SLAVE STATUS is empty", public.role)))?;
        index.binlog_info.show_slave_status = Some(BinlogStatus {
            master_host: upstream.master_host,
            master_port: upstream.master_port,
            ..Default::default()
        });
    }
    if let Some(requested) = public.is_full_backup {
        if requested != index.is_full_backup {
            warn!(
                "is_full_backup={} requested but {} {} gives {}",
                requested, index.backup_type, index.data_schema_grant, index.is_full_backup
            );
        }
    }
    Ok(index)
}

/// Resolve everything the dump needs. Nothing is written before this succeeds.
pub async fn plan(cnf: &BackupConfig, db: &MySQLService, ctx: &TaskContext) -> Result<Plan> {
    let facts = inspect(db, ctx).await?;
    let mut cnf = cnf.clone();
    let public = &mut cnf.public;
    public.backup_type = resolve_backup_type(public.backup_type, &public.data_schema_grant, &facts)?;
    public.charset = resolve_charset(&public.charset, public.backup_type, &public.data_schema_grant, &facts.charsets);
    if public.target_name.is_empty() {
        public.target_name = target_name(
            &public.cluster_address,
            public.shard_value,
            &public.host,
            public.port,
            Local::now(),
            &public.backup_type.to_string(),
        );
    }
    info!(
        "plan {}: type {} charset {} data_schema_grant {}",
        public.target_name, public.backup_type, public.charset, public.data_schema_grant
    );

    if !public.no_check_disk_space {
        let free = free_space(&public.backup_dir)?;
        check_disk_space(free, facts.data_size, public.backup_type)?;
    }
    let backup_client = resolve_backup_client(cnf.backup_client.enable, cnf.public.is_standby);

    let target = DumpTarget::new(cnf.public.backup_dir.clone(), cnf.public.target_name.clone());
    let index = new_index(&cnf, db, &facts).await?;
    let dumper = choose_dumper(&cnf, db, &facts, target.clone());
    Ok(Plan {
        cnf,
        facts,
        target,
        index,
        dumper,
        backup_client,
    })
}
