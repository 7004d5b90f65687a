//! Shipping the release package to a host.

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::server::Server;
use crate::ssh::{SshClient, SshSettings};
use crate::utils::{io, shell};

#[async_trait]
pub trait FileTransfer: Send + Sync {
    /// Copy `local` to `remote` on `server`, creating remote parents.
    async fn copy(&self, server: &Server, local: &Path, remote: &str) -> Result<()>;
}

/// Streams the file over the ssh binary and compares SHA-256 digests.
#[derive(Debug, Clone, Default)]
pub struct SshTransfer {
    ssh: SshSettings,
}

impl SshTransfer {
    pub fn new(ssh: SshSettings) -> Self {
        Self { ssh }
    }
}

#[async_trait]
impl FileTransfer for SshTransfer {
    async fn copy(&self, server: &Server, local: &Path, remote: &str) -> Result<()> {
        let client = SshClient::from_server(server, &self.ssh)?;

        let upload = client.upload_file(local, remote).await;
        if !upload.success() {
            return Err(Error::deploy_upload_failed(
                &server.host,
                upload.stderr.trim().to_string(),
            ));
        }

        let expected = local_digest(local.to_path_buf()).await?;
        let quoted = shell::quote_path(remote);
        let check = client
            .execute(&format!(
                "(sha256sum {q} 2>/dev/null || shasum -a 256 {q}) | cut -d' ' -f1",
                q = quoted
            ))
            .await;
        if !check.success() {
            return Err(Error::deploy_upload_failed(
                &server.host,
                format!("checksum failed: {}", check.stderr.trim()),
            ));
        }

        let actual = check.stdout.trim();
        if actual != expected {
            return Err(Error::deploy_upload_failed(
                &server.host,
                format!("checksum mismatch: local {} remote {}", expected, actual),
            ));
        }

        tracing::debug!(server_id = server.id, remote, sha256 = %expected, "package uploaded");
        Ok(())
    }
}

async fn local_digest(path: PathBuf) -> Result<String> {
    tokio::task::spawn_blocking(move || io::sha256_file(&path))
        .await
        .map_err(|e| Error::internal_unexpected(e.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::EntityStatus;

    #[tokio::test]
    async fn localhost_copy_verifies_digest() {
        let dir = tempfile::TempDir::new().unwrap();
        let local = dir.path().join("1_2_20240101_000000.zip");
        std::fs::write(&local, b"zip bytes").unwrap();
        let remote = dir.path().join("host/releases/1_2_20240101_000000.zip");

        let server = Server {
            id: 1,
            name: "loopback".to_string(),
            host: "localhost".to_string(),
            user: "deploy".to_string(),
            port: 22,
            identity_file: None,
            status: EntityStatus::Enabled,
        };
        SshTransfer::default()
            .copy(&server, &local, &remote.to_string_lossy())
            .await
            .unwrap();
        assert_eq!(std::fs::read(&remote).unwrap(), b"zip bytes");
    }
}
