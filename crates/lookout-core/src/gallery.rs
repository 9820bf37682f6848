//! Directory-backed gallery of known faces and pending captures.
//!
//! Layout under the base directory:
//!
//! ```text
//! known/<name>.<jpg|jpeg|png>
//! pending/<capture_id>.jpg
//! pending/<capture_id>.json
//! backups/<snapshot_id>/{known,pending,manifest.json}
//! template.key
//! ```
//!
//! Every file is written to a hidden temporary name and renamed into place.
//! A pending image without its metadata is an incomplete capture; it is
//! never listed and `clean` removes it by modification time.

use crate::analysis::{AnalysisError, FaceAnalyzer};
use crate::codec::{CodecError, StoredTemplate, TemplateCodec};
use crate::quality;
use crate::types::{KnownEntry, KnownRecord, PendingEntry, Promotion, Template};
use chrono::{DateTime, Utc};
use image::{ImageFormat, RgbImage};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;

const KNOWN_DIR: &str = "known";
const PENDING_DIR: &str = "pending";
const BACKUPS_DIR: &str = "backups";
const KEY_FILE: &str = "template.key";
const MANIFEST_FILE: &str = "manifest.json";
const KNOWN_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("invalid image: {0}")]
    InvalidImage(String),
    #[error("a face named '{0}' already exists")]
    DuplicateName(String),
    #[error("'{0}' not found")]
    NotFound(String),
    #[error("invalid name {0:?}")]
    InvalidName(String),
    #[error("capture {capture_id} was already promoted to '{to}'")]
    AlreadyPromoted { capture_id: String, to: String },
    #[error("template corrupt: {0}")]
    TemplateCorrupt(String),
    #[error("storage I/O ({context}): {source}")]
    StorageIo {
        context: String,
        #[source]
        source: io::Error,
    },
    #[error("face analysis failed: {0}")]
    Analysis(#[from] AnalysisError),
}

impl From<CodecError> for GalleryError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::TemplateCorrupt(reason) => Self::TemplateCorrupt(reason),
            other => Self::StorageIo {
                context: "template key".into(),
                source: io::Error::other(other.to_string()),
            },
        }
    }
}

fn storage(context: impl Into<String>) -> impl FnOnce(io::Error) -> GalleryError {
    let context = context.into();
    move |source| GalleryError::StorageIo { context, source }
}

/// Paths of a gallery rooted at one base directory.
#[derive(Debug, Clone)]
pub struct GalleryLayout {
    base: PathBuf,
}

impl GalleryLayout {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn known_dir(&self) -> PathBuf {
        self.base.join(KNOWN_DIR)
    }

    pub fn pending_dir(&self) -> PathBuf {
        self.base.join(PENDING_DIR)
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.base.join(BACKUPS_DIR)
    }

    pub fn key_path(&self) -> PathBuf {
        self.base.join(KEY_FILE)
    }
}

/// Image quality gate shared by `add` and `promote`.
#[derive(Debug, Clone, Copy)]
pub struct QualityPolicy {
    /// Minimum Laplacian variance; lower is rejected as blurry.
    pub blur_threshold: f64,
}

/// Metadata record stored next to each pending image.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PendingMetadata {
    capture_id: String,
    observed_at: DateTime<Utc>,
    image: String,
    template: StoredTemplate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    promoted: Option<Promotion>,
}

/// Manifest written into every backup snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupManifest {
    pub snapshot_id: String,
    pub created_at: DateTime<Utc>,
    pub known: usize,
    pub pending: usize,
}

/// Count of pending templates that decode with the current codec.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TemplateAudit {
    pub readable: usize,
    pub unreadable: usize,
}

pub struct GalleryStore {
    layout: GalleryLayout,
    codec: TemplateCodec,
    quality: QualityPolicy,
    /// Serializes every mutation of the on-disk gallery.
    write_lock: Mutex<()>,
}

impl GalleryStore {
    /// Open (and create if needed) the gallery directories.
    pub fn open(
        layout: GalleryLayout,
        codec: TemplateCodec,
        quality: QualityPolicy,
    ) -> Result<Self, GalleryError> {
        for dir in [layout.known_dir(), layout.pending_dir()] {
            fs::create_dir_all(&dir).map_err(storage(format!("create {}", dir.display())))?;
        }
        Ok(Self {
            layout,
            codec,
            quality,
            write_lock: Mutex::new(()),
        })
    }

    pub fn layout(&self) -> &GalleryLayout {
        &self.layout
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Encode every known image into a gallery entry.
    ///
    /// Images that fail to decode, or that do not contain exactly one face,
    /// are logged and skipped.
    pub fn load(&self, analyzer: &mut dyn FaceAnalyzer) -> Result<Vec<KnownEntry>, GalleryError> {
        let mut entries = Vec::new();
        for record in self.list_known()? {
            let image = match image::open(&record.image) {
                Ok(img) => img.to_rgb8(),
                Err(err) => {
                    tracing::warn!(name = %record.name, error = %err, "unreadable known image; skipped");
                    continue;
                }
            };
            match single_template(analyzer, &image) {
                Ok(template) => entries.push(KnownEntry {
                    name: record.name,
                    template,
                    created_at: record.created_at,
                }),
                Err(err) => {
                    tracing::warn!(name = %record.name, error = %err, "known face not loaded; skipped");
                }
            }
        }
        tracing::info!(count = entries.len(), "loaded known faces");
        Ok(entries)
    }

    /// Enroll `image_path` under `name`.
    pub fn add(
        &self,
        analyzer: &mut dyn FaceAnalyzer,
        name: &str,
        image_path: &Path,
    ) -> Result<KnownEntry, GalleryError> {
        check_name(name)?;
        if self.find_known(name)?.is_some() {
            return Err(GalleryError::DuplicateName(name.into()));
        }

        let ext = image_path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .filter(|e| KNOWN_EXTENSIONS.contains(&e.as_str()))
            .ok_or_else(|| {
                GalleryError::InvalidImage(format!(
                    "{} is not a .jpg, .jpeg or .png file",
                    image_path.display()
                ))
            })?;
        let bytes = fs::read(image_path).map_err(|e| {
            GalleryError::InvalidImage(format!("cannot read {}: {e}", image_path.display()))
        })?;
        let image = image::load_from_memory(&bytes)
            .map_err(|e| GalleryError::InvalidImage(format!("not a decodable image: {e}")))?
            .to_rgb8();
        let template = self.validate(analyzer, &image)?;

        let _guard = self.lock();
        if self.find_known(name)?.is_some() {
            return Err(GalleryError::DuplicateName(name.into()));
        }
        let dest = self.layout.known_dir().join(format!("{name}.{ext}"));
        write_atomic(&dest, &bytes)?;

        tracing::info!(name, path = %dest.display(), "added known face");
        Ok(KnownEntry {
            name: name.into(),
            template,
            created_at: Utc::now(),
        })
    }

    /// Delete every stored image for `name`.
    pub fn remove(&self, name: &str) -> Result<bool, GalleryError> {
        check_name(name)?;
        let _guard = self.lock();
        let files = self.known_files_named(name)?;
        if files.is_empty() {
            return Err(GalleryError::NotFound(name.into()));
        }
        for file in files {
            match fs::remove_file(&file) {
                Ok(()) => {}
                // Removed underneath us by another process: same outcome.
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(storage(format!("remove {}", file.display()))(e)),
            }
        }
        tracing::info!(name, "removed known face");
        Ok(true)
    }

    /// Persist a captured face and its template; returns the new capture id.
    pub fn save_pending(&self, image: &RgbImage, template: &Template) -> Result<String, GalleryError> {
        self.save_pending_at(image, template, Utc::now())
    }

    pub(crate) fn save_pending_at(
        &self,
        image: &RgbImage,
        template: &Template,
        observed_at: DateTime<Utc>,
    ) -> Result<String, GalleryError> {
        let stored = self.codec.encode(template)?;
        let mut jpeg = Vec::new();
        image
            .write_to(&mut io::Cursor::new(&mut jpeg), ImageFormat::Jpeg)
            .map_err(|e| storage("encode capture")(io::Error::other(e)))?;

        let _guard = self.lock();
        let pending = self.layout.pending_dir();
        let capture_id = loop {
            let id = new_capture_id(observed_at);
            if !pending.join(format!("{id}.jpg")).exists() && !pending.join(format!("{id}.json")).exists() {
                break id;
            }
        };

        let image_name = format!("{capture_id}.jpg");
        // Image first: a crash before the metadata lands leaves an
        // incomplete capture that `clean` can collect.
        write_atomic(&pending.join(&image_name), &jpeg)?;
        let meta = PendingMetadata {
            capture_id: capture_id.clone(),
            observed_at,
            image: image_name,
            template: stored,
            promoted: None,
        };
        write_metadata(&pending, &meta)?;

        tracing::info!(capture_id = %capture_id, "saved unknown face");
        Ok(capture_id)
    }

    /// Known faces sorted by name.
    pub fn list_known(&self) -> Result<Vec<KnownRecord>, GalleryError> {
        let dir = self.layout.known_dir();
        let mut records = Vec::new();
        for path in read_dir_files(&dir)? {
            let (Some(name), true) = (file_stem(&path), has_known_extension(&path)) else {
                continue;
            };
            records.push(KnownRecord {
                name: name.to_string(),
                created_at: modified_at(&path).unwrap_or_else(Utc::now),
                image: path,
            });
        }
        records.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.image.cmp(&b.image)));
        records.dedup_by(|b, a| a.name == b.name);
        Ok(records)
    }

    /// Complete pending captures, oldest first.
    ///
    /// Entries whose metadata or template cannot be read are logged and left
    /// out; they do not affect the others.
    pub fn list_pending(&self) -> Result<Vec<PendingEntry>, GalleryError> {
        let dir = self.layout.pending_dir();
        let mut entries = Vec::new();
        for meta in self.read_all_metadata(&dir)? {
            let image = dir.join(&meta.image);
            if !image.exists() {
                tracing::warn!(capture_id = %meta.capture_id, "pending image missing; skipped");
                continue;
            }
            let template = match self.codec.decode(&meta.template) {
                Ok(t) => t,
                Err(err) => {
                    tracing::warn!(capture_id = %meta.capture_id, error = %err, "pending template unreadable; skipped");
                    continue;
                }
            };
            entries.push(PendingEntry {
                capture_id: meta.capture_id,
                image,
                template,
                observed_at: meta.observed_at,
                promoted: meta.promoted,
            });
        }
        entries.sort_by(|a, b| {
            a.observed_at
                .cmp(&b.observed_at)
                .then_with(|| a.capture_id.cmp(&b.capture_id))
        });
        Ok(entries)
    }

    /// Count pending templates the current codec can and cannot open.
    pub fn audit_templates(&self) -> Result<TemplateAudit, GalleryError> {
        let mut audit = TemplateAudit::default();
        for meta in self.read_all_metadata(&self.layout.pending_dir())? {
            match self.codec.decode(&meta.template) {
                Ok(_) => audit.readable += 1,
                Err(_) => audit.unreadable += 1,
            }
        }
        Ok(audit)
    }

    /// Enroll a pending capture under `new_name`.
    ///
    /// The capture image passes the same gates as [`add`](Self::add). Its
    /// files stay in the pending directory, stamped as promoted.
    pub fn promote(
        &self,
        analyzer: &mut dyn FaceAnalyzer,
        capture_id: &str,
        new_name: &str,
    ) -> Result<KnownEntry, GalleryError> {
        check_name(new_name)?;
        let pending = self.layout.pending_dir();
        let meta = self.pending_metadata(&pending, capture_id)?;
        if let Some(p) = &meta.promoted {
            return Err(GalleryError::AlreadyPromoted {
                capture_id: capture_id.into(),
                to: p.to.clone(),
            });
        }
        if self.find_known(new_name)?.is_some() {
            return Err(GalleryError::DuplicateName(new_name.into()));
        }

        let image_path = pending.join(&meta.image);
        let bytes = fs::read(&image_path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => GalleryError::NotFound(capture_id.into()),
            _ => storage(format!("read {}", image_path.display()))(e),
        })?;
        let image = image::load_from_memory(&bytes)
            .map_err(|e| GalleryError::InvalidImage(format!("capture image unreadable: {e}")))?
            .to_rgb8();
        let template = self.validate(analyzer, &image)?;

        let _guard = self.lock();
        // Re-read under the lock: a concurrent clean or promote may have won.
        let mut meta = self.pending_metadata(&pending, capture_id)?;
        if let Some(p) = &meta.promoted {
            return Err(GalleryError::AlreadyPromoted {
                capture_id: capture_id.into(),
                to: p.to.clone(),
            });
        }
        if self.find_known(new_name)?.is_some() {
            return Err(GalleryError::DuplicateName(new_name.into()));
        }

        write_atomic(&self.layout.known_dir().join(format!("{new_name}.jpg")), &bytes)?;
        let now = Utc::now();
        meta.promoted = Some(Promotion {
            to: new_name.into(),
            at: now,
        });
        write_metadata(&pending, &meta)?;

        tracing::info!(capture_id, name = new_name, "promoted unknown face");
        Ok(KnownEntry {
            name: new_name.into(),
            template,
            created_at: now,
        })
    }

    /// Delete unpromoted captures observed before `now - older_than`.
    ///
    /// Captures without readable metadata are judged by file modification
    /// time. Returns the number of captures removed.
    pub fn clean(&self, older_than: Duration) -> Result<usize, GalleryError> {
        let cutoff = chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let _guard = self.lock();
        let dir = self.layout.pending_dir();
        let files = read_dir_files(&dir)?;
        let stems: HashSet<&str> = files
            .iter()
            .filter(|p| matches!(extension(p), Some("jpg" | "json")))
            .filter_map(|p| file_stem(p))
            .collect();

        let mut removed = 0;
        for stem in stems {
            let image = dir.join(format!("{stem}.jpg"));
            let meta_path = dir.join(format!("{stem}.json"));
            let observed = match read_metadata(&meta_path) {
                Ok(meta) if meta.promoted.is_some() => continue,
                Ok(meta) => Some(meta.observed_at),
                Err(_) => None,
            };
            let observed = observed
                .or_else(|| modified_at(&image))
                .or_else(|| modified_at(&meta_path));
            if !observed.is_some_and(|t| t < cutoff) {
                continue;
            }
            for path in [&image, &meta_path] {
                match fs::remove_file(path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(storage(format!("remove {}", path.display()))(e)),
                }
            }
            removed += 1;
        }

        tracing::info!(removed, cutoff = %cutoff, "cleaned pending captures");
        Ok(removed)
    }

    /// Copy known and pending storage into a new read-only snapshot.
    ///
    /// The template key is not part of the snapshot.
    pub fn backup(&self) -> Result<BackupManifest, GalleryError> {
        let _guard = self.lock();
        let created_at = Utc::now();
        let root = self.layout.backups_dir();
        fs::create_dir_all(&root).map_err(storage("create backups directory"))?;

        let stamp = created_at.format("%Y%m%d_%H%M%S").to_string();
        let mut snapshot_id = stamp.clone();
        let mut suffix = 0;
        let dest = loop {
            let candidate = root.join(&snapshot_id);
            match fs::create_dir(&candidate) {
                Ok(()) => break candidate,
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    suffix += 1;
                    snapshot_id = format!("{stamp}-{suffix}");
                }
                Err(e) => return Err(storage(format!("create {}", candidate.display()))(e)),
            }
        };

        let mut copied = Vec::new();
        let known = copy_tree(&self.layout.known_dir(), &dest.join(KNOWN_DIR), &mut copied)?;
        copy_tree(&self.layout.pending_dir(), &dest.join(PENDING_DIR), &mut copied)?;
        let pending = copied
            .iter()
            .filter(|p| p.starts_with(dest.join(PENDING_DIR)) && extension(p) == Some("json"))
            .count();

        let manifest = BackupManifest {
            snapshot_id,
            created_at,
            known,
            pending,
        };
        let manifest_path = dest.join(MANIFEST_FILE);
        let json = serde_json::to_vec_pretty(&manifest).map_err(|e| storage("encode manifest")(e.into()))?;
        write_atomic(&manifest_path, &json)?;
        copied.push(manifest_path);

        for path in &copied {
            set_readonly(path)?;
        }

        tracing::info!(snapshot = %manifest.snapshot_id, known, pending, "backup created");
        Ok(manifest)
    }

    /// Exactly one face, sharp enough, encoded.
    fn validate(&self, analyzer: &mut dyn FaceAnalyzer, image: &RgbImage) -> Result<Template, GalleryError> {
        let regions = analyzer.detect(image)?;
        match regions.len() {
            0 => return Err(GalleryError::InvalidImage("no face detected".into())),
            1 => {}
            n => {
                return Err(GalleryError::InvalidImage(format!(
                    "{n} faces detected, expected exactly one"
                )))
            }
        }

        let sharpness = quality::sharpness(image);
        if sharpness < self.quality.blur_threshold {
            return Err(GalleryError::InvalidImage(format!(
                "image is too blurry (sharpness {sharpness:.1}, need {:.1})",
                self.quality.blur_threshold
            )));
        }

        analyzer
            .encode(image, &regions)?
            .into_iter()
            .next()
            .ok_or_else(|| AnalysisError::InferenceFailed("encoder returned no template".into()).into())
    }

    fn find_known(&self, name: &str) -> Result<Option<PathBuf>, GalleryError> {
        Ok(self.known_files_named(name)?.into_iter().next())
    }

    fn known_files_named(&self, name: &str) -> Result<Vec<PathBuf>, GalleryError> {
        Ok(read_dir_files(&self.layout.known_dir())?
            .into_iter()
            .filter(|p| has_known_extension(p) && file_stem(p) == Some(name))
            .collect())
    }

    fn pending_metadata(&self, dir: &Path, capture_id: &str) -> Result<PendingMetadata, GalleryError> {
        if capture_id.is_empty() || capture_id.contains(['/', '\\']) || capture_id.starts_with('.') {
            return Err(GalleryError::NotFound(capture_id.into()));
        }
        let path = dir.join(format!("{capture_id}.json"));
        match read_metadata(&path) {
            Ok(meta) => Ok(meta),
            Err(MetadataError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                Err(GalleryError::NotFound(capture_id.into()))
            }
            Err(MetadataError::Io(e)) => Err(storage(format!("read {}", path.display()))(e)),
            Err(MetadataError::Json(e)) => Err(GalleryError::TemplateCorrupt(format!(
                "metadata for {capture_id}: {e}"
            ))),
        }
    }

    fn read_all_metadata(&self, dir: &Path) -> Result<Vec<PendingMetadata>, GalleryError> {
        let mut all = Vec::new();
        for path in read_dir_files(dir)? {
            if extension(&path) != Some("json") {
                continue;
            }
            match read_metadata(&path) {
                Ok(meta) => all.push(meta),
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "unreadable capture metadata; skipped");
                }
            }
        }
        Ok(all)
    }
}

/// Detect + validate a single face and return its template.
fn single_template(analyzer: &mut dyn FaceAnalyzer, image: &RgbImage) -> Result<Template, GalleryError> {
    let regions = analyzer.detect(image)?;
    if regions.len() != 1 {
        return Err(GalleryError::InvalidImage(format!(
            "{} faces detected, expected exactly one",
            regions.len()
        )));
    }
    analyzer
        .encode(image, &regions)?
        .into_iter()
        .next()
        .ok_or_else(|| AnalysisError::InferenceFailed("encoder returned no template".into()).into())
}

fn check_name(name: &str) -> Result<(), GalleryError> {
    if name.is_empty() || name.starts_with('.') || name.contains(['/', '\\', '\0']) {
        return Err(GalleryError::InvalidName(name.into()));
    }
    Ok(())
}

fn new_capture_id(at: DateTime<Utc>) -> String {
    let token = uuid::Uuid::new_v4().simple().to_string();
    format!("{}_{}", at.format("%Y%m%d_%H%M%S"), &token[..8])
}

#[derive(Debug, Error)]
enum MetadataError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

fn read_metadata(path: &Path) -> Result<PendingMetadata, MetadataError> {
    Ok(serde_json::from_slice(&fs::read(path)?)?)
}

fn write_metadata(dir: &Path, meta: &PendingMetadata) -> Result<(), GalleryError> {
    let json = serde_json::to_vec_pretty(meta).map_err(|e| storage("encode metadata")(e.into()))?;
    write_atomic(&dir.join(format!("{}.json", meta.capture_id)), &json)
}

/// Write to a hidden sibling, fsync, then rename over `path`.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), GalleryError> {
    use std::io::Write;

    let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("file");
    let tmp = path.with_file_name(format!(".{file_name}.tmp"));
    let ctx = || format!("write {}", path.display());

    let mut file = fs::File::create(&tmp).map_err(storage(ctx()))?;
    file.write_all(bytes).map_err(storage(ctx()))?;
    file.sync_all().map_err(storage(ctx()))?;
    drop(file);
    fs::rename(&tmp, path).map_err(storage(ctx()))
}

/// Regular, non-hidden files directly inside `dir`, sorted.
fn read_dir_files(dir: &Path) -> Result<Vec<PathBuf>, GalleryError> {
    let ctx = || format!("list {}", dir.display());
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).map_err(storage(ctx()))? {
        let entry = entry.map_err(storage(ctx()))?;
        let path = entry.path();
        let hidden = entry.file_name().to_string_lossy().starts_with('.');
        if !hidden && path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn copy_tree(src: &Path, dest: &Path, copied: &mut Vec<PathBuf>) -> Result<usize, GalleryError> {
    fs::create_dir_all(dest).map_err(storage(format!("create {}", dest.display())))?;
    let mut count = 0;
    for path in read_dir_files(src)? {
        let Some(name) = path.file_name() else { continue };
        let target = dest.join(name);
        fs::copy(&path, &target).map_err(storage(format!("copy {}", path.display())))?;
        copied.push(target);
        count += 1;
    }
    Ok(count)
}

fn set_readonly(path: &Path) -> Result<(), GalleryError> {
    let ctx = || format!("protect {}", path.display());
    let mut perms = fs::metadata(path).map_err(storage(ctx()))?.permissions();
    perms.set_readonly(true);
    fs::set_permissions(path, perms).map_err(storage(ctx()))
}

fn extension(path: &Path) -> Option<&str> {
    path.extension().and_then(|e| e.to_str())
}

fn has_known_extension(path: &Path) -> bool {
    extension(path).is_some_and(|e| KNOWN_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
}

fn file_stem(path: &Path) -> Option<&str> {
    path.file_stem().and_then(|s| s.to_str())
}

fn modified_at(path: &Path) -> Option<DateTime<Utc>> {
    fs::metadata(path).and_then(|m| m.modified()).ok().map(DateTime::<Utc>::from)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::codec::TemplateKey;
    use crate::types::FaceRegion;
    use image::Rgb;
    use tempfile::TempDir;

    const MARKER: u32 = 8;
    const MARKER_STEP: f32 = 60.0;

    /// Analyzer double. The face count is read from the grey level of the
    /// top-left 8×8 block (one face per 60 levels), which survives JPEG.
    /// The template is the mean colour of the image.
    pub(crate) struct FakeAnalyzer;

    impl FaceAnalyzer for FakeAnalyzer {
        fn detect(&mut self, image: &RgbImage) -> Result<Vec<FaceRegion>, AnalysisError> {
            if image.width() < MARKER || image.height() < MARKER {
                return Ok(Vec::new());
            }
            let mut sum = 0.0f32;
            for y in 0..MARKER {
                for x in 0..MARKER {
                    sum += image.get_pixel(x, y).0[0] as f32;
                }
            }
            let faces = (sum / (MARKER * MARKER) as f32 / MARKER_STEP).round() as u32;
            Ok((0..faces)
                .map(|i| FaceRegion {
                    top: MARKER,
                    right: MARKER + 2 * i + 2,
                    bottom: MARKER + 2,
                    left: MARKER + 2 * i,
                    confidence: 0.99,
                })
                .collect())
        }

        fn encode(&mut self, image: &RgbImage, regions: &[FaceRegion]) -> Result<Vec<Template>, AnalysisError> {
            let n = (image.width() * image.height()) as f32;
            let mut sum = [0.0f32; 3];
            for p in image.pixels() {
                for (acc, v) in sum.iter_mut().zip(p.0) {
                    *acc += v as f32;
                }
            }
            let t = Template::new(sum.iter().map(|s| s / n / 255.0).collect());
            Ok(regions.iter().map(|_| t.clone()).collect())
        }
    }

    /// Sharp grey test image carrying `faces` in its marker block.
    pub(crate) fn face_image(faces: u32, seed: u8) -> RgbImage {
        let level = (faces as f32 * MARKER_STEP) as u8;
        RgbImage::from_fn(32, 32, |x, y| {
            if x < MARKER && y < MARKER {
                return Rgb([level, level, level]);
            }
            let v = if (x + y) % 2 == 0 { 250 } else { seed };
            Rgb([v, v, v])
        })
    }

    pub(crate) fn write_png(dir: &Path, name: &str, image: &RgbImage) -> PathBuf {
        let path = dir.join(name);
        image.save(&path).unwrap();
        path
    }

    pub(crate) fn store(dir: &TempDir, codec: TemplateCodec) -> GalleryStore {
        GalleryStore::open(
            GalleryLayout::new(dir.path().join("gallery")),
            codec,
            QualityPolicy { blur_threshold: 100.0 },
        )
        .unwrap()
    }

    #[test]
    fn test_add_then_duplicate_fails() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, TemplateCodec::plaintext());
        let img = write_png(dir.path(), "alice.png", &face_image(1, 10));
        let img2 = write_png(dir.path(), "alice2.png", &face_image(1, 20));

        let entry = store.add(&mut FakeAnalyzer, "Alice", &img).unwrap();
        assert_eq!(entry.name, "Alice");
        assert!(store.layout().known_dir().join("Alice.png").exists());

        let err = store.add(&mut FakeAnalyzer, "Alice", &img2).unwrap_err();
        assert!(matches!(err, GalleryError::DuplicateName(n) if n == "Alice"));
    }

    #[test]
    fn test_names_are_case_sensitive() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, TemplateCodec::plaintext());
        let img = write_png(dir.path(), "a.png", &face_image(1, 10));
        store.add(&mut FakeAnalyzer, "Alice", &img).unwrap();
        assert!(store.add(&mut FakeAnalyzer, "alice", &img).is_ok());
    }

    #[test]
    fn test_add_rejects_bad_images() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, TemplateCodec::plaintext());

        let none = write_png(dir.path(), "none.png", &face_image(0, 10));
        let two = write_png(dir.path(), "two.png", &face_image(2, 10));
        let blurry = write_png(
            dir.path(),
            "blurry.png",
            &RgbImage::from_fn(32, 32, |x, y| {
                if x < MARKER && y < MARKER {
                    Rgb([60, 60, 60])
                } else {
                    Rgb([90, 90, 90])
                }
            }),
        );
        let text = dir.path().join("notes.txt");
        fs::write(&text, "hello").unwrap();
        let garbage = dir.path().join("garbage.jpg");
        fs::write(&garbage, "not a jpeg").unwrap();

        for path in [&none, &two, &blurry, &text, &garbage] {
            let err = store.add(&mut FakeAnalyzer, "Bob", path).unwrap_err();
            assert!(matches!(err, GalleryError::InvalidImage(_)), "{path:?}: {err}");
        }
        assert!(store.list_known().unwrap().is_empty());
    }

    #[test]
    fn test_add_rejects_path_like_names() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, TemplateCodec::plaintext());
        let img = write_png(dir.path(), "a.png", &face_image(1, 10));
        for name in ["", "../evil", ".hidden", "a/b"] {
            assert!(matches!(
                store.add(&mut FakeAnalyzer, name, &img),
                Err(GalleryError::InvalidName(_))
            ));
        }
    }

    #[test]
    fn test_remove_twice_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, TemplateCodec::plaintext());
        let img = write_png(dir.path(), "a.png", &face_image(1, 10));
        store.add(&mut FakeAnalyzer, "Alice", &img).unwrap();

        assert!(store.remove("Alice").unwrap());
        assert!(matches!(store.remove("Alice"), Err(GalleryError::NotFound(_))));
    }

    #[test]
    fn test_list_known_sorted() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, TemplateCodec::plaintext());
        let img = write_png(dir.path(), "a.png", &face_image(1, 10));
        for name in ["Carol", "Alice", "Bob"] {
            store.add(&mut FakeAnalyzer, name, &img).unwrap();
        }
        fs::write(store.layout().known_dir().join("README.txt"), "ignored").unwrap();

        let names: Vec<_> = store.list_known().unwrap().into_iter().map(|r| r.name).collect();
        assert_eq!(names, ["Alice", "Bob", "Carol"]);
    }

    #[test]
    fn test_load_skips_faceless_images() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, TemplateCodec::plaintext());
        let known = store.layout().known_dir();
        write_png(&known, "Alice.png", &face_image(1, 10));
        write_png(&known, "Crowd.png", &face_image(3, 10));
        write_png(&known, "Empty.png", &face_image(0, 10));
        fs::write(known.join("Broken.jpg"), "nope").unwrap();

        let entries = store.load(&mut FakeAnalyzer).unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["Alice"]);
        assert_eq!(entries[0].template.dimension(), 3);
    }

    #[test]
    fn test_save_pending_round_trips_sealed_template() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, TemplateCodec::sealed(TemplateKey::generate()));
        let template = Template::new(vec![0.125, -3.5, 1.0e-9]);

        let id = store.save_pending(&face_image(1, 10), &template).unwrap();
        let pending = store.list_pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].capture_id, id);
        assert_eq!(pending[0].template, template);
        assert!(pending[0].promoted.is_none());

        let raw = fs::read_to_string(store.layout().pending_dir().join(format!("{id}.json"))).unwrap();
        assert!(raw.contains("\"sealed\""));
        assert!(!raw.contains("0.125"));
    }

    #[test]
    fn test_capture_ids_are_unique() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, TemplateCodec::plaintext());
        let t = Template::new(vec![0.0]);
        let ids: HashSet<String> = (0..20)
            .map(|_| store.save_pending(&face_image(1, 10), &t).unwrap())
            .collect();
        assert_eq!(ids.len(), 20);
    }

    #[test]
    fn test_list_pending_skips_incomplete_and_foreign_key() {
        let dir = TempDir::new().unwrap();
        let sealed = store(&dir, TemplateCodec::sealed(TemplateKey::generate()));
        sealed.save_pending(&face_image(1, 10), &Template::new(vec![1.0])).unwrap();

        // Same directory, different key: the sealed capture is unreadable.
        let rekeyed = store(&dir, TemplateCodec::sealed(TemplateKey::generate()));
        let ok = rekeyed.save_pending(&face_image(1, 10), &Template::new(vec![2.0])).unwrap();
        fs::write(rekeyed.layout().pending_dir().join("orphan.jpg"), "x").unwrap();

        let listed: Vec<_> = rekeyed.list_pending().unwrap().into_iter().map(|p| p.capture_id).collect();
        assert_eq!(listed, [ok]);
        assert_eq!(
            rekeyed.audit_templates().unwrap(),
            TemplateAudit { readable: 1, unreadable: 1 }
        );
    }

    #[test]
    fn test_promote_copies_and_stamps() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, TemplateCodec::plaintext());
        let id = store.save_pending(&face_image(1, 10), &Template::new(vec![0.5])).unwrap();

        let entry = store.promote(&mut FakeAnalyzer, &id, "Dave").unwrap();
        assert_eq!(entry.name, "Dave");
        assert!(store.layout().known_dir().join("Dave.jpg").exists());

        let pending = store.list_pending().unwrap();
        assert_eq!(pending[0].promoted.as_ref().map(|p| p.to.as_str()), Some("Dave"));
        assert!(pending[0].image.exists());

        assert!(matches!(
            store.promote(&mut FakeAnalyzer, &id, "Eve"),
            Err(GalleryError::AlreadyPromoted { .. })
        ));
    }

    #[test]
    fn test_promote_errors_match_add() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, TemplateCodec::plaintext());
        let img = write_png(dir.path(), "a.png", &face_image(1, 10));
        store.add(&mut FakeAnalyzer, "Dave", &img).unwrap();

        let good = store.save_pending(&face_image(1, 10), &Template::new(vec![0.0])).unwrap();
        assert!(matches!(
            store.promote(&mut FakeAnalyzer, &good, "Dave"),
            Err(GalleryError::DuplicateName(_))
        ));

        let faceless = store.save_pending(&face_image(0, 10), &Template::new(vec![0.0])).unwrap();
        assert!(matches!(
            store.promote(&mut FakeAnalyzer, &faceless, "Erin"),
            Err(GalleryError::InvalidImage(_))
        ));

        assert!(matches!(
            store.promote(&mut FakeAnalyzer, "20200101_000000_deadbeef", "Erin"),
            Err(GalleryError::NotFound(_))
        ));
        assert!(matches!(
            store.promote(&mut FakeAnalyzer, "../known/Dave", "Erin"),
            Err(GalleryError::NotFound(_))
        ));
    }

    #[test]
    fn test_clean_respects_cutoff() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, TemplateCodec::plaintext());
        let one_second_ago = Utc::now() - chrono::Duration::seconds(1);
        store
            .save_pending_at(&face_image(1, 10), &Template::new(vec![0.0]), one_second_ago)
            .unwrap();

        assert_eq!(store.clean(Duration::from_secs(86_400)).unwrap(), 0);
        assert_eq!(store.list_pending().unwrap().len(), 1);

        assert_eq!(store.clean(Duration::ZERO).unwrap(), 1);
        assert!(store.list_pending().unwrap().is_empty());
        assert!(read_dir_files(&store.layout().pending_dir()).unwrap().is_empty());

        assert_eq!(store.clean(Duration::ZERO).unwrap(), 0);
    }

    #[test]
    fn test_clean_keeps_promoted_and_collects_incomplete() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, TemplateCodec::plaintext());
        let old = Utc::now() - chrono::Duration::days(90);
        let id = store.save_pending_at(&face_image(1, 10), &Template::new(vec![0.0]), old).unwrap();
        store.promote(&mut FakeAnalyzer, &id, "Frank").unwrap();

        // Incomplete capture: image without metadata, judged by mtime.
        fs::write(store.layout().pending_dir().join("20200101_000000_abcdef01.jpg"), "x").unwrap();
        std::thread::sleep(Duration::from_millis(20));

        assert_eq!(store.clean(Duration::ZERO).unwrap(), 1);
        let remaining = store.list_pending().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].capture_id, id);
    }

    #[test]
    fn test_backup_creates_new_readonly_snapshot_each_time() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, TemplateCodec::plaintext());
        let img = write_png(dir.path(), "a.png", &face_image(1, 10));
        store.add(&mut FakeAnalyzer, "Alice", &img).unwrap();
        store.save_pending(&face_image(1, 10), &Template::new(vec![0.0])).unwrap();

        let first = store.backup().unwrap();
        let second = store.backup().unwrap();
        assert_ne!(first.snapshot_id, second.snapshot_id);
        assert_eq!((first.known, first.pending), (1, 1));

        let snap = store.layout().backups_dir().join(&first.snapshot_id);
        let manifest: BackupManifest =
            serde_json::from_slice(&fs::read(snap.join(MANIFEST_FILE)).unwrap()).unwrap();
        assert_eq!(manifest, first);
        let copied = snap.join(KNOWN_DIR).join("Alice.png");
        assert!(fs::metadata(&copied).unwrap().permissions().readonly());
        assert!(!snap.join(KEY_FILE).exists());
    }
}
