use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use git2::{Repository, Signature};

use super::{ArtifactSnapshot, ArtifactStore, content_hash};
use crate::errors::ArtifactError;
use crate::util::write_atomic;

/// Artifact store over files on disk.
///
/// References are paths, resolved against `base_dir` when relative. Every
/// version that passes through the store is archived under
/// `archive_dir/<reference key>/<hash>.md`, and commits can optionally be
/// recorded in the enclosing git repository.
pub struct FileArtifactStore {
    base_dir: PathBuf,
    archive_dir: PathBuf,
    git_commit: bool,
}

impl FileArtifactStore {
    pub fn new(base_dir: impl Into<PathBuf>, archive_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            archive_dir: archive_dir.into(),
            git_commit: false,
        }
    }

    /// Record every committed fix as a git commit.
    pub fn with_git_commit(mut self, enabled: bool) -> Self {
        self.git_commit = enabled;
        self
    }

    fn resolve(&self, reference: &str) -> PathBuf {
        let path = Path::new(reference);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    fn reference_dir(&self, reference: &str) -> PathBuf {
        let key = content_hash(&self.resolve(reference).to_string_lossy());
        self.archive_dir.join(&key[..16])
    }

    fn io_err(path: &Path, source: std::io::Error) -> ArtifactError {
        ArtifactError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn read_path(path: &Path, reference: &str) -> Result<String, ArtifactError> {
        fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ArtifactError::NotFound(reference.to_string()),
            _ => Self::io_err(path, e),
        })
    }

    fn archive_path(&self, reference: &str, snapshot: &ArtifactSnapshot) -> PathBuf {
        self.reference_dir(reference)
            .join(format!("{}.md", snapshot.hash))
    }

    /// Archive `snapshot`. The caller holds [`lock`](Self::lock) for
    /// `reference`, since every writer shares one temp file name.
    fn archive(&self, reference: &str, snapshot: &ArtifactSnapshot) -> Result<(), ArtifactError> {
        let target = self.archive_path(reference, snapshot);
        if target.exists() {
            return Ok(());
        }
        if let Some(dir) = target.parent() {
            fs::create_dir_all(dir).map_err(|e| Self::io_err(dir, e))?;
        }
        write_atomic(&target, snapshot.content.as_bytes()).map_err(|e| Self::io_err(&target, e))
    }

    fn lock(&self, reference: &str) -> Result<File, ArtifactError> {
        let dir = self.reference_dir(reference);
        fs::create_dir_all(&dir).map_err(|e| Self::io_err(&dir, e))?;
        let lock_path = dir.join(".lock");
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|e| Self::io_err(&lock_path, e))?;
        file.lock_exclusive()
            .map_err(|e| Self::io_err(&lock_path, e))?;
        Ok(file)
    }

    fn record_git_commit(&self, path: &Path, message: &str) {
        if let Err(e) = git_commit_file(path, message) {
            tracing::warn!(path = %path.display(), error = %e, "git commit of artifact failed");
        }
    }
}

impl ArtifactStore for FileArtifactStore {
    fn read(&self, reference: &str) -> Result<ArtifactSnapshot, ArtifactError> {
        let path = self.resolve(reference);
        let snapshot = ArtifactSnapshot::new(Self::read_path(&path, reference)?);
        if !self.archive_path(reference, &snapshot).exists() {
            let _lock = self.lock(reference)?;
            self.archive(reference, &snapshot)?;
        }
        Ok(snapshot)
    }

    fn commit(
        &self,
        reference: &str,
        expected_hash: &str,
        content: &str,
        message: &str,
    ) -> Result<ArtifactSnapshot, ArtifactError> {
        let path = self.resolve(reference);
        let lock = self.lock(reference)?;

        let current = ArtifactSnapshot::new(Self::read_path(&path, reference)?);
        if current.hash != expected_hash {
            return Err(ArtifactError::Conflict {
                reference: reference.to_string(),
                expected: expected_hash.to_string(),
                actual: current.hash,
            });
        }
        self.archive(reference, &current)?;

        let next = ArtifactSnapshot::new(content);
        write_atomic(&path, next.content.as_bytes()).map_err(|e| Self::io_err(&path, e))?;
        self.archive(reference, &next)?;
        drop(lock);

        tracing::debug!(
            reference,
            from = current.short_hash(),
            to = next.short_hash(),
            "artifact committed"
        );
        if self.git_commit {
            self.record_git_commit(&path, message);
        }
        Ok(next)
    }

    fn load_version(&self, reference: &str, hash: &str) -> Result<Option<String>, ArtifactError> {
        let target = self.reference_dir(reference).join(format!("{}.md", hash));
        match fs::read_to_string(&target) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Self::io_err(&target, e)),
        }
    }
}

fn git_commit_file(path: &Path, message: &str) -> Result<(), git2::Error> {
    let repo = Repository::discover(path.parent().unwrap_or(Path::new(".")))?;
    let workdir = repo
        .workdir()
        .ok_or_else(|| git2::Error::from_str("bare repository"))?
        .canonicalize()
        .map_err(|e| git2::Error::from_str(&e.to_string()))?;
    let absolute = path
        .canonicalize()
        .map_err(|e| git2::Error::from_str(&e.to_string()))?;
    let relative = absolute
        .strip_prefix(&workdir)
        .map_err(|_| git2::Error::from_str("artifact is outside the repository"))?;

    let mut index = repo.index()?;
    index.add_path(relative)?;
    index.write()?;
    let tree = repo.find_tree(index.write_tree()?)?;
    let sig = Signature::now("gauntlet", "gauntlet@localhost")?;

    let parent = repo.head().ok().and_then(|h| h.peel_to_commit().ok());
    let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();
    repo.commit(
        Some("HEAD"),
        &sig,
        &sig,
        &format!("[gauntlet] {}", message),
        &tree,
        &parents,
    )?;
    Ok(())
}
