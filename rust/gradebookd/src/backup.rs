use crate::db::DB_FILE_NAME;
use anyhow::{anyhow, bail, Context};
use rusqlite::{Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

const MANIFEST_ENTRY: &str = "manifest.json";
const DB_ENTRY: &str = "db/gradebook.sqlite3";
const META_WORKSPACE_ENTRY: &str = "meta/workspace.json";
pub const BUNDLE_FORMAT: &str = "gradebook-workspace-v1";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleManifest {
    pub format: String,
    pub app_version: String,
    pub exported_at: String,
    pub db_entry: String,
    pub db_sha256: String,
    pub db_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct ExportSummary {
    pub bundle_format: String,
    pub entry_count: usize,
    pub db_sha256: String,
}

#[derive(Debug, Clone)]
pub struct ImportSummary {
    pub bundle_format: String,
    pub exported_at: String,
    pub db_bytes: u64,
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

fn write_json_entry<W: Write + std::io::Seek>(
    zip: &mut ZipWriter<W>,
    name: &str,
    value: &impl Serialize,
    opts: FileOptions,
) -> anyhow::Result<()> {
    zip.start_file(name, opts)
        .with_context(|| format!("failed to start {} entry", name))?;
    let text = serde_json::to_string_pretty(value)
        .with_context(|| format!("failed to serialize {}", name))?;
    zip.write_all(text.as_bytes())
        .with_context(|| format!("failed to write {} entry", name))?;
    Ok(())
}

/// Resolves `path` through symlinks and `..`, even when the file itself
/// does not exist yet.
fn resolved_path(path: &Path) -> Option<PathBuf> {
    if let Ok(p) = path.canonicalize() {
        return Some(p);
    }
    let name = path.file_name()?;
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    parent.canonicalize().ok().map(|p| p.join(name))
}

fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(suffix);
    path.with_file_name(name)
}

/// Writes `<workspace>/gradebook.sqlite3` into a zip bundle at `out_path`.
/// The caller must not hold an open write transaction on the database.
pub fn export_workspace_bundle(
    workspace_path: &Path,
    out_path: &Path,
) -> anyhow::Result<ExportSummary> {
    let db_path = workspace_path.join(DB_FILE_NAME);
    if !db_path.is_file() {
        bail!("workspace database not found: {}", db_path.display());
    }
    if let (Some(db), Some(out)) = (resolved_path(&db_path), resolved_path(out_path)) {
        if db == out {
            bail!(
                "refusing to overwrite the workspace database with a bundle: {}",
                out_path.display()
            );
        }
    }
    let db_bytes = std::fs::read(&db_path)
        .with_context(|| format!("failed to read database {}", db_path.display()))?;
    let db_sha256 = sha256_hex(&db_bytes);

    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }
    let tmp_out = sibling_with_suffix(out_path, ".tmp");
    let written = write_bundle(&tmp_out, workspace_path, &db_bytes, &db_sha256);
    if let Err(e) = written {
        let _ = std::fs::remove_file(&tmp_out);
        return Err(e);
    }
    std::fs::rename(&tmp_out, out_path)
        .with_context(|| format!("failed to move bundle to {}", out_path.display()))?;

    Ok(ExportSummary {
        bundle_format: BUNDLE_FORMAT.to_string(),
        entry_count: 3,
        db_sha256,
    })
}

fn write_bundle(
    path: &Path,
    workspace_path: &Path,
    db_bytes: &[u8],
    db_sha256: &str,
) -> anyhow::Result<()> {
    let out_file = File::create(path)
        .with_context(|| format!("failed to create output file {}", path.display()))?;
    let mut zip = ZipWriter::new(out_file);
    let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);

    let manifest = BundleManifest {
        format: BUNDLE_FORMAT.to_string(),
        app_version: env!("CARGO_PKG_VERSION").to_string(),
        exported_at: chrono::Utc::now().to_rfc3339(),
        db_entry: DB_ENTRY.to_string(),
        db_sha256: db_sha256.to_string(),
        db_bytes: db_bytes.len() as u64,
    };
    write_json_entry(&mut zip, MANIFEST_ENTRY, &manifest, opts)?;

    zip.start_file(DB_ENTRY, opts)
        .context("failed to start database entry")?;
    zip.write_all(db_bytes)
        .context("failed to write database entry")?;

    let workspace_meta = serde_json::json!({
        "sourceWorkspace": workspace_path.to_string_lossy(),
        "dbFileName": DB_FILE_NAME,
    });
    write_json_entry(&mut zip, META_WORKSPACE_ENTRY, &workspace_meta, opts)?;

    zip.finish().context("failed to finalize zip bundle")?;
    Ok(())
}

/// Reads and checks a bundle without touching any workspace.
pub fn read_bundle(in_path: &Path) -> anyhow::Result<(BundleManifest, Vec<u8>)> {
    if !is_zip_file(in_path)? {
        bail!("not a workspace bundle: {}", in_path.display());
    }

    let in_file = File::open(in_path)
        .with_context(|| format!("failed to open bundle {}", in_path.display()))?;
    let mut archive = ZipArchive::new(in_file).context("invalid zip archive")?;

    let mut manifest_text = String::new();
    archive
        .by_name(MANIFEST_ENTRY)
        .context("bundle missing manifest.json")?
        .read_to_string(&mut manifest_text)
        .context("failed to read manifest.json")?;
    let manifest: BundleManifest =
        serde_json::from_str(&manifest_text).context("manifest.json is invalid")?;
    if manifest.format != BUNDLE_FORMAT {
        bail!("unsupported bundle format: {}", manifest.format);
    }

    let mut db_bytes = Vec::new();
    archive
        .by_name(&manifest.db_entry)
        .with_context(|| format!("bundle missing {}", manifest.db_entry))?
        .read_to_end(&mut db_bytes)
        .context("failed to extract database entry")?;

    let actual = sha256_hex(&db_bytes);
    if !actual.eq_ignore_ascii_case(&manifest.db_sha256) {
        return Err(anyhow!(
            "database checksum mismatch: manifest {}, actual {}",
            manifest.db_sha256,
            actual
        ));
    }
    Ok((manifest, db_bytes))
}

/// A bundle database extracted next to the live one and checked to be a
/// readable gradebook database. Dropping it without `commit` removes the
/// extracted file.
#[derive(Debug)]
pub struct StagedImport {
    staged: PathBuf,
    target: PathBuf,
    summary: ImportSummary,
}

fn check_staged_database(path: &Path) -> anyhow::Result<()> {
    let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
        .context("bundle database cannot be opened")?;
    let tables: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('settings', 'semesters')",
            [],
            |r| r.get(0),
        )
        .context("bundle database is not a readable SQLite database")?;
    if tables != 2 {
        bail!("bundle database is not a gradebook workspace");
    }
    Ok(())
}

/// Extracts and checks the bundle's database without touching the live
/// workspace database.
pub fn stage_import(in_path: &Path, workspace_path: &Path) -> anyhow::Result<StagedImport> {
    let (manifest, db_bytes) = read_bundle(in_path)?;

    std::fs::create_dir_all(workspace_path)
        .with_context(|| format!("failed to create workspace {}", workspace_path.display()))?;
    let target = workspace_path.join(DB_FILE_NAME);
    let staged = sibling_with_suffix(&target, ".importing");
    if staged.exists() {
        let _ = std::fs::remove_file(&staged);
    }
    let staged = StagedImport {
        staged,
        target,
        summary: ImportSummary {
            bundle_format: manifest.format,
            exported_at: manifest.exported_at,
            db_bytes: manifest.db_bytes,
        },
    };

    {
        let mut db_out = File::create(&staged.staged).with_context(|| {
            format!("failed to create temp database {}", staged.staged.display())
        })?;
        db_out
            .write_all(&db_bytes)
            .context("failed to write extracted database")?;
        db_out
            .flush()
            .context("failed to flush extracted database")?;
    }
    check_staged_database(&staged.staged)?;
    Ok(staged)
}

impl StagedImport {
    /// Moves the staged database over the workspace database. The
    /// workspace connection must be closed first.
    pub fn commit(self) -> anyhow::Result<ImportSummary> {
        if self.target.exists() {
            std::fs::remove_file(&self.target).with_context(|| {
                format!("failed to remove existing database {}", self.target.display())
            })?;
        }
        std::fs::rename(&self.staged, &self.target).with_context(|| {
            format!("failed to move extracted database to {}", self.target.display())
        })?;
        Ok(self.summary.clone())
    }
}

impl Drop for StagedImport {
    fn drop(&mut self) {
        if self.staged.exists() {
            let _ = std::fs::remove_file(&self.staged);
        }
    }
}

/// Replaces `<workspace>/gradebook.sqlite3` with the bundle's database.
/// The workspace connection must be closed first.
pub fn import_workspace_bundle(
    in_path: &Path,
    workspace_path: &Path,
) -> anyhow::Result<ImportSummary> {
    stage_import(in_path, workspace_path)?.commit()
}

fn is_zip_file(path: &Path) -> anyhow::Result<bool> {
    let mut f = File::open(path)
        .with_context(|| format!("failed to open input file {}", path.display()))?;
    let mut sig = [0u8; 4];
    let read = f.read(&mut sig).context("failed to read file signature")?;
    if read < 4 {
        return Ok(false);
    }
    Ok(sig == [0x50, 0x4B, 0x03, 0x04])
}
