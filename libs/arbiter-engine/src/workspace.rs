use crate::sandbox::docker::make_world_readable;
use crate::sandbox::Artifact;
use arbiter_common::LanguageProfile;
use std::path::Path;
use tempfile::TempDir;
use uuid::Uuid;

/// Per-submission working directory
///
/// Holds the source file and, after compilation, the compiled output. The
/// directory is removed when the workspace is dropped, so every exit path
/// of an execution cleans up after itself.
pub struct Workspace {
    dir: TempDir,
    artifact: Artifact,
}

impl Workspace {
    pub async fn create(
        root: &Path,
        submission_id: &Uuid,
        profile: &LanguageProfile,
        source_code: &str,
    ) -> std::io::Result<Self> {
        tokio::fs::create_dir_all(root).await?;

        let dir = tempfile::Builder::new()
            .prefix(&format!("arbiter-{}-", submission_id))
            .tempdir_in(root)?;

        let source_path = dir.path().join(&profile.source_file);
        tokio::fs::write(&source_path, source_code).await?;

        // Sandboxed runs drop every capability, including the ones that
        // bypass file permissions
        make_world_readable(dir.path(), 0o755).await?;
        make_world_readable(&source_path, 0o644).await?;

        let artifact = Artifact {
            dir: dir.path().to_path_buf(),
            source_file: profile.source_file.clone(),
            source_code: source_code.to_string(),
        };

        Ok(Self { dir, artifact })
    }

    pub fn artifact(&self) -> &Artifact {
        &self.artifact
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}
