use std::path::{Path, PathBuf};
use log::{debug, info};
use regex::Regex;
use tokio::io::AsyncWriteExt;
use crate::context::TaskContext;
use crate::error::{BackupError, Result};
use crate::index::{FileType, IndexContent};
use crate::packager::Cipher;
use crate::runner::{MyExec, Pipeline, Sink};
use crate::utils::find_tool;

/// Above this many parts the file list is streamed into tar instead of passed as `cat` arguments.
pub const STREAM_PARTS_THRESHOLD: usize = 10;

fn part_regex() -> Regex {
    Regex::new(r"\.part_(\d+)(\.enc)?$").expect("static regex")
}

fn tar_regex() -> Regex {
    Regex::new(r"^(.*?)(_\d+)?\.tar(\.gz|\.enc)?$").expect("static regex")
}

/// Split parts sorted by number, and standalone tar files in index order.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Artifacts {
    pub split_parts: Vec<String>,
    pub tar_parts: Vec<String>,
}

pub fn classify(index: &IndexContent) -> Result<Artifacts> {
    let part_re = part_regex();
    let mut numbered = Vec::new();
    let mut artifacts = Artifacts::default();
    for item in &index.file_list {
        match item.file_type {
            FileType::Priv | FileType::Index => continue,
            _ => {}
        }
        if let Some(caps) = part_re.captures(&item.file_name) {
            let number: u64 = caps[1]
                .parse()
                .map_err(|_| BackupError::integrity(format!("bad part number in {}", item.file_name)))?;
            numbered.push((number, item.file_name.clone()));
        } else if tar_regex().is_match(&item.file_name) {
            artifacts.tar_parts.push(item.file_name.clone());
        } else {
            return Err(BackupError::integrity(format!("unknown artifact {}", item.file_name)));
        }
    }
    check_consecutive(&mut numbered)?;
    artifacts.split_parts = numbered.into_iter().map(|(_, name)| name).collect();
    check_common_prefix(&artifacts.tar_parts)?;
    Ok(artifacts)
}

/// Part numbers must run without gaps from 0 or 1.
pub fn check_consecutive(parts: &mut Vec<(u64, String)>) -> Result<()> {
    parts.sort_by_key(|(n, _)| *n);
    let Some((first, _)) = parts.first() else {
        return Ok(());
    };
    if *first > 1 {
        return Err(BackupError::integrity(format!(
            "part files not consecutive: first part number is {}",
            first
        )));
    }
    for pair in parts.windows(2) {
        if pair[1].0 != pair[0].0 + 1 {
            return Err(BackupError::integrity(format!(
                "part files not consecutive: {} followed by {}",
                pair[0].1, pair[1].1
            )));
        }
    }
    Ok(())
}

pub fn check_common_prefix(tars: &[String]) -> Result<()> {
    let re = tar_regex();
    let mut prefix: Option<String> = None;
    for name in tars {
        let stem = re
            .captures(name)
            .map(|c| c[1].to_string())
            .ok_or_else(|| BackupError::integrity(format!("unknown tar file {}", name)))?;
        match &prefix {
            None => prefix = Some(stem),
            Some(p) if *p == stem => {}
            Some(p) => {
                return Err(BackupError::integrity(format!(
                    "tar files do not share a prefix: {} vs {}",
                    p, stem
                )))
            }
        }
    }
    Ok(())
}

/// Reassembles the artifacts an index lists into a staging directory.
pub struct Unpackager {
    index_path: PathBuf,
    staging: PathBuf,
    tool_dir: PathBuf,
    cipher: Option<Cipher>,
}

impl Unpackager {
    pub fn new(index_path: &Path, staging: &Path, tool_dir: &Path) -> Unpackager {
        Unpackager {
            index_path: index_path.to_path_buf(),
            staging: staging.to_path_buf(),
            tool_dir: tool_dir.to_path_buf(),
            cipher: None,
        }
    }

    pub fn with_cipher(mut self, cipher: Option<Cipher>) -> Unpackager {
        self.cipher = cipher;
        self
    }

    fn decrypt_leg(&self) -> Result<MyExec> {
        let cipher = self
            .cipher
            .as_ref()
            .ok_or_else(|| BackupError::config("backup is encrypted but [EncryptOpt] is not enabled"))?;
        Ok(MyExec::new(&cipher.name(), &cipher.program).args(cipher.decrypt_args()))
    }

    fn tar_leg(&self, tar: &Path, flags: &str, source: &str) -> MyExec {
        MyExec::new("tar", tar)
            .arg(flags)
            .arg(source)
            .arg("-C")
            .arg(self.staging.to_string_lossy())
            .stdout(Sink::Discard)
    }

    /// Validate and extract; returns the parsed index and the extracted target directory.
    pub async fn unpack(&self, ctx: &TaskContext) -> Result<(IndexContent, PathBuf)> {
        let index = IndexContent::load(&self.index_path)?;
        let dir = index.artifact_dir(&self.index_path);
        let artifacts = classify(&index)?;
        index.verify_files(&dir)?;
        if artifacts.split_parts.is_empty() && artifacts.tar_parts.is_empty() {
            return Err(BackupError::integrity(format!(
                "{} lists no tar or part files",
                self.index_path.display()
            )));
        }
        tokio::fs::create_dir_all(&self.staging).await?;
        let tar = find_tool(&self.tool_dir, "tar")?;

        if !artifacts.split_parts.is_empty() {
            let parts: Vec<PathBuf> = artifacts.split_parts.iter().map(|n| dir.join(n)).collect();
            let encrypted = artifacts.split_parts.iter().any(|n| n.ends_with(".enc"));
            if parts.len() <= STREAM_PARTS_THRESHOLD {
                self.extract_joined(&tar, &parts, encrypted, ctx).await?;
            } else {
                self.extract_streamed(&tar, &parts, encrypted, ctx).await?;
            }
        }
        for name in &artifacts.tar_parts {
            self.extract_tar(&tar, &dir.join(name), ctx).await?;
        }

        let target = self.staging.join(&index.target_name);
        if !target.is_dir() {
            return Err(BackupError::integrity(format!(
                "extracted directory {} not found",
                target.display()
            )));
        }
        info!("unpacked {} into {}", self.index_path.display(), target.display());
        Ok((index, target))
    }

    /// `cat parts | [decrypt |] tar -xf -`
    async fn extract_joined(&self, tar: &Path, parts: &[PathBuf], encrypted: bool, ctx: &TaskContext) -> Result<()> {
        let cat = find_tool(&self.tool_dir, "cat")?;
        let mut pipeline = Pipeline::new(
            MyExec::new("cat", cat).args(parts.iter().map(|p| p.to_string_lossy().to_string())),
        );
        if encrypted {
            pipeline = pipeline.pipe(self.decrypt_leg()?);
        }
        pipeline.pipe(self.tar_leg(tar, "-xf", "-")).start()?.wait(ctx).await?;
        if ctx.remove_original {
            for part in parts {
                tokio::fs::remove_file(part).await?;
            }
        }
        Ok(())
    }

    /// Feed parts one after another into the pipeline stdin, keeping argv short.
    async fn extract_streamed(&self, tar: &Path, parts: &[PathBuf], encrypted: bool, ctx: &TaskContext) -> Result<()> {
        debug!("streaming {} parts into tar", parts.len());
        let pipeline = if encrypted {
            Pipeline::new(self.decrypt_leg()?.stdin_piped()).pipe(self.tar_leg(tar, "-xf", "-"))
        } else {
            Pipeline::new(self.tar_leg(tar, "-xf", "-").stdin_piped())
        };
        let mut running = pipeline.start()?;
        let mut stdin = running
            .take_stdin()
            .ok_or_else(|| BackupError::tool("tar", "stdin not piped"))?;
        let remove = ctx.remove_original;
        let feed = async move {
            for part in parts {
                let mut file = tokio::fs::File::open(part).await?;
                tokio::io::copy(&mut file, &mut stdin).await?;
                if remove {
                    tokio::fs::remove_file(part).await?;
                }
            }
            stdin.shutdown().await?;
            Ok::<(), BackupError>(())
        };
        let (fed, waited) = tokio::join!(feed, running.wait(ctx));
        fed?;
        waited?;
        Ok(())
    }

    async fn extract_tar(&self, tar: &Path, path: &Path, ctx: &TaskContext) -> Result<()> {
        let name = path.to_string_lossy().to_string();
        if name.ends_with(".enc") {
            Pipeline::new(self.decrypt_leg()?.stdin_file(path))
                .pipe(self.tar_leg(tar, "-xf", "-"))
                .start()?
                .wait(ctx)
                .await?;
        } else if name.ends_with(".gz") {
            self.tar_leg(tar, "-zxf", &name).run(ctx).await?;
        } else {
            self.tar_leg(tar, "-xf", &name).run(ctx).await?;
        }
        if ctx.remove_original {
            tokio::fs::remove_file(path).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;
    use tempfile::TempDir;
    use crate::config::{BackupType, DataSchemaGrant, MysqlRole};
    use crate::index::TarFileItem;
    use crate::packager::{part_name, Packager};
    use crate::service::service::{DumpTarget, PackStrategy};

    fn ctx() -> TaskContext {
        TaskContext::new(&CancellationToken::new(), Duration::from_millis(50))
    }

    fn index_with(names: &[&str]) -> IndexContent {
        let mut index = IndexContent::new(
            "id".to_string(),
            "127.0.0.1".to_string(),
            3306,
            MysqlRole::Master,
            BackupType::Physical,
            DataSchemaGrant::ALL,
        );
        index.target_name = "t".to_string();
        for name in names {
            index.add_file(TarFileItem {
                file_name: name.to_string(),
                file_size: 1,
                file_type: if name.contains(".part_") { FileType::Part } else { FileType::Tar },
                contain_files: vec![],
            });
        }
        index
    }

    #[test]
    fn test_classify_orders_parts() {
        let index = index_with(&["t.part_10", "t.part_09", "t.part_00", "t.part_01", "t.part_02", "t.part_03",
            "t.part_04", "t.part_05", "t.part_06", "t.part_07", "t.part_08"]);
        let artifacts = classify(&index).unwrap();
        assert_eq!(artifacts.split_parts.first().unwrap(), "t.part_00");
        assert_eq!(artifacts.split_parts.last().unwrap(), "t.part_10");
    }

    #[test]
    fn test_missing_part_rejected() {
        let index = index_with(&["t.part_0", "t.part_1", "t.part_2", "t.part_4"]);
        let err = classify(&index).unwrap_err();
        assert!(err.to_string().contains("part files not consecutive"));

        let from_one = index_with(&["t.part_1", "t.part_2"]);
        assert!(classify(&from_one).is_ok());
        let from_two = index_with(&["t.part_2", "t.part_3"]);
        assert!(classify(&from_two).is_err());
    }

    #[tokio::test]
    async fn test_unpack_rejects_part_gap() {
        let dir = TempDir::new().unwrap();
        let mut index = index_with(&[]);
        for i in 0..5 {
            let name = format!("t.part_{}", i);
            std::fs::write(dir.path().join(&name), b"abc").unwrap();
            index.add_file(TarFileItem {
                file_name: name,
                file_size: 3,
                file_type: FileType::Part,
                contain_files: vec![],
            });
        }
        index.file_list.retain(|f| f.file_name != "t.part_3");
        let index_path = dir.path().join("t.index");
        index.save(&index_path).unwrap();

        let err = Unpackager::new(&index_path, &dir.path().join("staging"), Path::new("/nonexistent"))
            .unpack(&ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::Integrity(_)));
        assert!(err.to_string().contains("part files not consecutive: t.part_2 followed by t.part_4"), "{}", err);
    }

    #[test]
    fn test_tar_prefix() {
        assert!(check_common_prefix(&["t_0.tar".to_string(), "t_1.tar.enc".to_string()]).is_ok());
        assert!(check_common_prefix(&["t_0.tar".to_string(), "u_1.tar".to_string()]).is_err());
    }

    async fn round_trip(file_count: usize, threshold: u64, strategy: PackStrategy) {
        let dir = TempDir::new().unwrap();
        let work = dir.path().join("t");
        std::fs::create_dir_all(work.join("db1")).unwrap();
        for i in 0..file_count {
            std::fs::write(work.join("db1").join(format!("f{}.ibd", i)), vec![i as u8; 700]).unwrap();
        }
        std::fs::write(work.join("metadata"), "Started dump at: 2024-01-02 03:04:05\n").unwrap();

        let mut index = index_with(&[]);
        let packager = Packager::new_for_test(dir.path(), threshold);
        packager.pack(strategy, &mut index, &ctx()).await.unwrap();
        let index_path = dir.path().join("t.index");
        index.save(&index_path).unwrap();

        let staging = dir.path().join("staging");
        let mut ctx = ctx();
        ctx.remove_original = true;
        let (_, target) = Unpackager::new(&index_path, &staging, Path::new("/nonexistent"))
            .unpack(&ctx)
            .await
            .unwrap();
        assert_eq!(target, staging.join("t"));
        for i in 0..file_count {
            let data = std::fs::read(target.join("db1").join(format!("f{}.ibd", i))).unwrap();
            assert_eq!(data, vec![i as u8; 700]);
        }
        assert!(target.join("metadata").is_file());
        for item in &index.file_list {
            assert!(!dir.path().join(&item.file_name).exists());
        }
    }

    #[tokio::test]
    async fn test_unpack_few_parts() {
        round_trip(3, 2048, PackStrategy::SplitStream).await;
    }

    #[tokio::test]
    async fn test_unpack_many_parts_streamed() {
        round_trip(20, 1024, PackStrategy::SplitStream).await;
    }

    #[tokio::test]
    async fn test_unpack_tar_parts() {
        round_trip(4, 1024, PackStrategy::TarParts).await;
    }

    #[test]
    fn test_part_name_matches_regex() {
        let name = part_name("t", 7, 12, ".enc");
        let caps = part_regex().captures(&name).unwrap();
        assert_eq!(&caps[1], "07");
    }

    impl Packager {
        fn new_for_test(dir: &Path, threshold: u64) -> Packager {
            let mut cnf = crate::config::BackupConfig::from_ini(&ini::Ini::new()).unwrap();
            cnf.public.io_limit_mb_per_sec = 0;
            let packager = Packager::new(&cnf, DumpTarget::new(dir.to_path_buf(), "t".to_string())).unwrap();
            packager.with_threshold(threshold)
        }
    }
}
