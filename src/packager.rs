use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::thread;
use log::{debug, info};
use tokio_util::sync::CancellationToken;
use crate::config::{BackupConfig, EncryptOptConfig};
use crate::context::TaskContext;
use crate::error::{BackupError, Result};
use crate::index::{FileType, IndexContent, TarFileItem};
use crate::service::service::{DumpTarget, PackStrategy};
use crate::throttle::{remove_dir_limited, remove_file_limited, Throttle, ThrottledWriter};
use crate::utils::find_tool;

/// Members with these extensions are already compressed; their raw size is unknown.
const COMPRESSED_EXTENSIONS: [&str; 4] = ["gz", "zst", "qp", "lz4"];

/// Stream cipher run as a filter process (`xbcrypt` by default).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cipher {
    pub program: PathBuf,
    pub algo: String,
    pub key_file: PathBuf,
}

impl Cipher {
    pub fn from_config(encrypt: &EncryptOptConfig, tool_dir: &Path) -> Result<Option<Cipher>> {
        if !encrypt.encrypt_enable {
            return Ok(None);
        }
        if !encrypt.encrypt_key_file.is_file() {
            return Err(BackupError::config(format!(
                "encrypt key file {} not found",
                encrypt.encrypt_key_file.display()
            )));
        }
        Ok(Some(Cipher {
            program: find_tool(tool_dir, &encrypt.encrypt_cmd)?,
            algo: encrypt.encrypt_algo.clone(),
            key_file: encrypt.encrypt_key_file.clone(),
        }))
    }

    pub fn name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "xbcrypt".to_string())
    }

    /// stdin plaintext to stdout ciphertext.
    pub fn encrypt_args(&self) -> Vec<String> {
        vec![
            format!("--encrypt-algo={}", self.algo),
            format!("--encrypt-key-file={}", self.key_file.display()),
        ]
    }

    pub fn decrypt_args(&self) -> Vec<String> {
        let mut args = vec!["-d".to_string()];
        args.extend(self.encrypt_args());
        args
    }
}

/// Destination of a tar stream, optionally passed through the cipher process.
enum Output<W: Write + Send + 'static> {
    Plain(W),
    Encrypted {
        name: String,
        child: Child,
        stdin: Option<ChildStdin>,
        pump: thread::JoinHandle<io::Result<W>>,
    },
}

impl<W: Write + Send + 'static> Output<W> {
    fn new(inner: W, cipher: Option<&Cipher>) -> Result<Output<W>> {
        let Some(cipher) = cipher else {
            return Ok(Output::Plain(inner));
        };
        let name = cipher.name();
        let mut child = Command::new(&cipher.program)
            .args(cipher.encrypt_args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| BackupError::tool(&name, format!("spawn {}: {}", cipher.program.display(), e)))?;
        let stdin = child.stdin.take();
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| BackupError::tool(&name, "stdout not captured"))?;
        let mut inner = inner;
        let pump = thread::spawn(move || {
            io::copy(&mut stdout, &mut inner)?;
            inner.flush()?;
            Ok(inner)
        });
        Ok(Output::Encrypted {
            name,
            child,
            stdin,
            pump,
        })
    }

    fn finish(self) -> Result<W> {
        match self {
            Output::Plain(mut inner) => {
                inner.flush()?;
                Ok(inner)
            }
            Output::Encrypted {
                name,
                mut child,
                stdin,
                pump,
            } => {
                drop(stdin);
                let status = child.wait()?;
                let inner = pump
                    .join()
                    .map_err(|_| BackupError::tool(&name, "output pump panicked"))??;
                if !status.success() {
                    return Err(BackupError::tool(name, format!("encrypt stream {}", status)));
                }
                Ok(inner)
            }
        }
    }
}

impl<W: Write + Send + 'static> Write for Output<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Output::Plain(inner) => inner.write(buf),
            Output::Encrypted { stdin, .. } => match stdin {
                Some(pipe) => pipe.write(buf),
                None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "cipher stdin closed")),
            },
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Output::Plain(inner) => inner.flush(),
            Output::Encrypted { stdin, .. } => match stdin {
                Some(pipe) => pipe.flush(),
                None => Ok(()),
            },
        }
    }
}

/// Digits used for part numbers when there are `total` parts numbered from 0.
pub fn part_width(total: usize) -> usize {
    total.saturating_sub(1).to_string().len().max(1)
}

pub fn part_name(stem: &str, number: usize, total: usize, suffix: &str) -> String {
    format!("{}.part_{:0width$}{}", stem, number, suffix, width = part_width(total))
}

/// Cuts one byte stream into `threshold`-sized files. Parts are written under
/// temporary names and renamed once the total count fixes the padding width.
pub struct SplitWriter {
    dir: PathBuf,
    stem: String,
    suffix: String,
    threshold: u64,
    current: Option<File>,
    current_len: u64,
    parts: Vec<PathBuf>,
}

impl SplitWriter {
    pub fn new(dir: &Path, stem: &str, suffix: &str, threshold: u64) -> SplitWriter {
        SplitWriter {
            dir: dir.to_path_buf(),
            stem: stem.to_string(),
            suffix: suffix.to_string(),
            threshold: threshold.max(1),
            current: None,
            current_len: 0,
            parts: Vec::new(),
        }
    }

    fn rotate(&mut self) -> io::Result<()> {
        if let Some(mut file) = self.current.take() {
            file.flush()?;
        }
        let path = self.dir.join(format!("{}.part_tmp{}", self.stem, self.parts.len()));
        self.current = Some(File::create(&path)?);
        self.current_len = 0;
        self.parts.push(path);
        Ok(())
    }

    /// Final part paths in order.
    pub fn finish(mut self) -> io::Result<Vec<PathBuf>> {
        if let Some(file) = self.current.take() {
            file.sync_all()?;
        }
        let total = self.parts.len();
        let mut done = Vec::with_capacity(total);
        for (i, tmp) in self.parts.iter().enumerate() {
            let path = self.dir.join(part_name(&self.stem, i, total, &self.suffix));
            fs::rename(tmp, &path)?;
            done.push(path);
        }
        Ok(done)
    }
}

impl Write for SplitWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.current.is_none() || self.current_len >= self.threshold {
            self.rotate()?;
        }
        let room = (self.threshold - self.current_len) as usize;
        let n = buf.len().min(room);
        let written = match self.current.as_mut() {
            Some(file) => file.write(&buf[..n])?,
            None => return Err(io::Error::new(io::ErrorKind::Other, "no open part")),
        };
        self.current_len += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.current.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

/// Files and directories under `root`, depth-first in lexical order, relative to `root`.
fn walk(root: &Path) -> Result<Vec<(PathBuf, bool)>> {
    fn visit(root: &Path, dir: &Path, out: &mut Vec<(PathBuf, bool)>) -> Result<()> {
        let mut entries = fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .collect::<Vec<_>>();
        entries.sort();
        for path in entries {
            let rel = path.strip_prefix(root).map(Path::to_path_buf).unwrap_or_else(|_| path.clone());
            if fs::symlink_metadata(&path)?.is_dir() {
                out.push((rel, true));
                visit(root, &path, out)?;
            } else {
                out.push((rel, false));
            }
        }
        Ok(())
    }
    let mut out = Vec::new();
    visit(root, root, &mut out)?;
    Ok(out)
}

/// mydumper schema, view, trigger and metadata files go in the first tar.
pub fn is_schema_file(name: &str) -> bool {
    name == "metadata" || name.contains("-schema")
}

fn is_compressed(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| COMPRESSED_EXTENSIONS.contains(&e))
        .unwrap_or(false)
}

/// What one packaging run produced.
#[derive(Debug, Default)]
pub struct PackResult {
    pub items: Vec<TarFileItem>,
    pub raw_bytes: u64,
    pub has_compressed_member: bool,
}

impl PackResult {
    pub fn size_kb_uncompress(&self) -> i64 {
        if self.has_compressed_member {
            -1
        } else {
            (self.raw_bytes / 1024) as i64
        }
    }
}

type TarWriter = tar::Builder<ThrottledWriter<Output<File>>>;

struct Packing {
    target: DumpTarget,
    threshold: u64,
    io_limit: u64,
    cipher: Option<Cipher>,
    token: CancellationToken,
    remover: Throttle,
    result: PackResult,
}

impl Packing {
    fn tar_suffix(&self) -> &'static str {
        if self.cipher.is_some() {
            ".tar.enc"
        } else {
            ".tar"
        }
    }

    fn check(&self) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(BackupError::Cancelled);
        }
        Ok(())
    }

    fn open_tar(&self, path: &Path) -> Result<TarWriter> {
        let file = File::create(path)?;
        let output = Output::new(file, self.cipher.as_ref())?;
        Ok(tar::Builder::new(ThrottledWriter::new(output, self.io_limit)))
    }

    fn close_tar(&self, builder: TarWriter, path: &Path) -> Result<u64> {
        let file = builder.into_inner()?.into_inner().finish()?;
        file.sync_all()?;
        Ok(fs::metadata(path)?.len())
    }

    fn member_name(&self, rel: &Path) -> PathBuf {
        Path::new(&self.target.target_name).join(rel)
    }

    /// Append one entry, then delete the source file.
    fn append<W: Write>(&mut self, builder: &mut tar::Builder<W>, rel: &Path, is_dir: bool) -> Result<()> {
        self.check()?;
        let path = self.target.dir().join(rel);
        let name = self.member_name(rel);
        if is_dir {
            builder.append_dir(&name, &path)?;
            return Ok(());
        }
        builder.append_path_with_name(&path, &name)?;
        self.result.raw_bytes += fs::metadata(&path)?.len();
        self.result.has_compressed_member |= is_compressed(&path);
        remove_file_limited(&path, &mut self.remover)?;
        Ok(())
    }

    fn tar_parts(&mut self) -> Result<()> {
        let entries = walk(&self.target.dir())?;
        let (schema, data): (Vec<_>, Vec<_>) = entries.into_iter().partition(|(rel, is_dir)| {
            *is_dir || rel.file_name().map(|n| is_schema_file(&n.to_string_lossy())).unwrap_or(false)
        });

        let first = self.target.backup_dir.join(format!("{}_0{}", self.target.target_name, self.tar_suffix()));
        let mut builder = self.open_tar(&first)?;
        let mut contain = Vec::new();
        for (rel, is_dir) in &schema {
            self.append(&mut builder, rel, *is_dir)?;
            if !is_dir {
                contain.push(rel.to_string_lossy().to_string());
            }
        }
        let size = self.close_tar(builder, &first)?;
        self.push_item(&first, size, FileType::Tar, contain);

        let mut current: Option<(TarWriter, PathBuf, Vec<String>)> = None;
        let mut next = 1;
        for (rel, _) in &data {
            let full = current
                .as_ref()
                .map(|(b, _, _)| b.get_ref().written() >= self.threshold)
                .unwrap_or(true);
            if full {
                if let Some((builder, path, contain)) = current.take() {
                    let size = self.close_tar(builder, &path)?;
                    self.push_item(&path, size, FileType::Tar, contain);
                }
                let path = self
                    .target
                    .backup_dir
                    .join(format!("{}_{}{}", self.target.target_name, next, self.tar_suffix()));
                next += 1;
                current = Some((self.open_tar(&path)?, path, Vec::new()));
            }
            if let Some((builder, _, contain)) = current.as_mut() {
                self.append(builder, rel, false)?;
                contain.push(rel.to_string_lossy().to_string());
            }
        }
        if let Some((builder, path, contain)) = current.take() {
            let size = self.close_tar(builder, &path)?;
            self.push_item(&path, size, FileType::Tar, contain);
        }
        Ok(())
    }

    fn split_stream(&mut self) -> Result<()> {
        let suffix = if self.cipher.is_some() { ".enc" } else { "" };
        let splitter = SplitWriter::new(&self.target.backup_dir, &self.target.target_name, suffix, self.threshold);
        let output = Output::new(splitter, self.cipher.as_ref())?;
        let mut builder = tar::Builder::new(ThrottledWriter::new(output, self.io_limit));
        for (rel, is_dir) in walk(&self.target.dir())? {
            self.append(&mut builder, &rel, is_dir)?;
        }
        let parts = builder.into_inner()?.into_inner().finish()?.finish()?;
        for path in parts {
            let size = fs::metadata(&path)?.len();
            self.push_item(&path, size, FileType::Part, Vec::new());
        }
        Ok(())
    }

    fn tar_then_split(&mut self) -> Result<()> {
        let tar_path = self
            .target
            .backup_dir
            .join(format!("{}{}", self.target.target_name, self.tar_suffix()));
        let mut builder = self.open_tar(&tar_path)?;
        for (rel, is_dir) in walk(&self.target.dir())? {
            self.append(&mut builder, &rel, is_dir)?;
        }
        let size = self.close_tar(builder, &tar_path)?;
        if size <= self.threshold {
            self.push_item(&tar_path, size, FileType::Tar, Vec::new());
            return Ok(());
        }

        self.check()?;
        let suffix = if self.cipher.is_some() { ".enc" } else { "" };
        let splitter = SplitWriter::new(&self.target.backup_dir, &self.target.target_name, suffix, self.threshold);
        let mut writer = ThrottledWriter::new(splitter, self.io_limit);
        io::copy(&mut File::open(&tar_path)?, &mut writer)?;
        let parts = writer.into_inner().finish()?;
        fs::remove_file(&tar_path)?;
        for path in parts {
            let size = fs::metadata(&path)?.len();
            self.push_item(&path, size, FileType::Part, Vec::new());
        }
        Ok(())
    }

    fn push_item(&mut self, path: &Path, size: u64, file_type: FileType, contain_files: Vec<String>) {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        debug!("packed {} ({} bytes)", file_name, size);
        self.result.items.push(TarFileItem {
            file_name,
            file_size: size,
            file_type,
            contain_files,
        });
    }
}

/// Turns a finished dump directory into tar or part artifacts next to it.
pub struct Packager {
    target: DumpTarget,
    threshold: u64,
    io_limit: u64,
    cipher: Option<Cipher>,
}

impl Packager {
    pub fn new(cnf: &BackupConfig, target: DumpTarget) -> Result<Packager> {
        Ok(Packager {
            target,
            threshold: cnf.tar_size_threshold(),
            io_limit: cnf.io_limit_bytes(),
            cipher: Cipher::from_config(&cnf.encrypt_opt, &cnf.public.tool_dir)?,
        })
    }

    pub fn with_cipher(mut self, cipher: Option<Cipher>) -> Packager {
        self.cipher = cipher;
        self
    }

    #[cfg(test)]
    pub(crate) fn with_threshold(mut self, threshold: u64) -> Packager {
        self.threshold = threshold;
        self
    }

    /// Package and record artifacts in `index`. The dump directory is gone afterwards.
    pub async fn pack(&self, strategy: PackStrategy, index: &mut IndexContent, ctx: &TaskContext) -> Result<()> {
        index.encrypt_enable = self.cipher.is_some();
        if strategy == PackStrategy::None {
            return Ok(());
        }
        info!("packing {} as {:?}", self.target.dir().display(), strategy);

        let mut packing = Packing {
            target: self.target.clone(),
            threshold: self.threshold,
            io_limit: self.io_limit,
            cipher: self.cipher.clone(),
            token: ctx.token().clone(),
            remover: Throttle::new(self.io_limit),
            result: PackResult::default(),
        };
        let joined = tokio::task::spawn_blocking(move || {
            let outcome = match strategy {
                PackStrategy::TarParts => packing.tar_parts(),
                PackStrategy::SplitStream => packing.split_stream(),
                PackStrategy::TarThenSplit => packing.tar_then_split(),
                PackStrategy::None => Ok(()),
            };
            outcome.map(|_| packing.result)
        })
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let result = match joined {
            Err(BackupError::Cancelled) => return Err(ctx.cancel_error()),
            other => other?,
        };

        for item in result.items.iter().cloned() {
            index.add_file(item);
        }
        index.total_size_kb_uncompress = result.size_kb_uncompress();

        let dir = self.target.dir();
        let io_limit = self.io_limit;
        tokio::task::spawn_blocking(move || {
            if dir.exists() {
                remove_dir_limited(&dir, io_limit)
            } else {
                Ok(())
            }
        })
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))??;
        info!(
            "packed {} files, total {} bytes",
            result.items.len(),
            index.total_filesize
        );
        Ok(())
    }
}
