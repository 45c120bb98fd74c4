//! Dumper that runs an external export program.
//!
//! The program writes the export to stdout; it is compressed with zstd on the
//! way into the staging area. The credential reaches the child through an
//! environment variable, never through argv.

use super::{DumpResult, Dumper};
use crate::config::DumpConfig;
use crate::secrets::Credential;
use crate::utils::errors::DumpError;
use crate::utils::tail_text;
use async_compression::tokio::write::ZstdEncoder;
use async_trait::async_trait;
use std::io;
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::process::Command;
use tracing::{debug, info};

const STDERR_TAIL_BYTES: usize = 4096;

#[derive(Debug, Clone)]
pub struct CommandDumper {
    program: String,
    args: Vec<String>,
    credential_env: String,
    file_name: String,
}

impl CommandDumper {
    pub fn new(config: &DumpConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            credential_env: config.credential_env.clone(),
            file_name: config.file_name.clone(),
        }
    }
}

#[async_trait]
impl Dumper for CommandDumper {
    async fn dump(&self, credential: &Credential, destination: &Path) -> Result<DumpResult, DumpError> {
        let output_path = destination.join(&self.file_name);
        debug!(program = %self.program, output = %output_path.display(), "Starting database export");

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env(&self.credential_env, credential.expose())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| DumpError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("export stdout was not captured"))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| io::Error::other("export stderr was not captured"))?;
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stderr.read_to_end(&mut buf).await;
            buf
        });

        let file = tokio::fs::File::create(&output_path).await?;
        let mut encoder = ZstdEncoder::new(BufWriter::new(file));

        let copied = tokio::io::copy(&mut stdout, &mut encoder).await;
        let finished = match copied {
            Ok(bytes) => encoder.shutdown().await.map(|_| bytes),
            Err(e) => Err(e),
        };
        let raw_bytes = match finished {
            Ok(bytes) => bytes,
            Err(e) => {
                // Disk full or similar: do not leave the export running
                let _ = child.kill().await;
                return Err(DumpError::Io(e));
            }
        };
        encoder.into_inner().into_inner().sync_all().await?;

        let status = child.wait().await?;
        let stderr = stderr_task.await.unwrap_or_default();
        if !status.success() {
            let stderr = String::from_utf8_lossy(&stderr).replace(credential.expose(), "<redacted>");
            return Err(DumpError::Exit {
                program: self.program.clone(),
                status: status.to_string(),
                stderr: tail_text(&stderr, STDERR_TAIL_BYTES),
            });
        }

        let total_bytes = tokio::fs::metadata(&output_path).await?.len();
        info!(
            program = %self.program,
            raw_bytes,
            compressed_bytes = total_bytes,
            "Database export finished"
        );

        Ok(DumpResult {
            files: vec![output_path],
            total_bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn dumper(script: &str) -> CommandDumper {
        CommandDumper::new(&DumpConfig {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            credential_env: "DATABASE_URL".to_string(),
            file_name: "database.sql.zst".to_string(),
        })
    }

    fn credential() -> Credential {
        Credential::new("postgres://clinic:s3cret@db/clinic")
    }

    #[tokio::test]
    async fn test_export_is_compressed_into_destination() {
        let temp_dir = TempDir::new().unwrap();
        let dumper = dumper("test -n \"$DATABASE_URL\" && printf 'CREATE TABLE patients (id int);\\n'");

        let result = dumper.dump(&credential(), temp_dir.path()).await.unwrap();
        assert_eq!(result.files, vec![temp_dir.path().join("database.sql.zst")]);

        let compressed = std::fs::read(&result.files[0]).unwrap();
        assert_eq!(result.total_bytes, compressed.len() as u64);
        let raw = zstd::decode_all(compressed.as_slice()).unwrap();
        assert_eq!(raw, b"CREATE TABLE patients (id int);\n");
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_reported() {
        let temp_dir = TempDir::new().unwrap();
        let dumper = dumper("printf 'partial'; echo 'FATAL: connection refused' >&2; exit 3");

        match dumper.dump(&credential(), temp_dir.path()).await {
            Err(DumpError::Exit { status, stderr, .. }) => {
                assert!(status.contains('3'));
                assert!(stderr.contains("connection refused"));
            }
            other => panic!("expected exit failure, got {:?}", other.map(|r| r.files)),
        }
    }

    #[tokio::test]
    async fn test_credential_is_redacted_from_stderr() {
        let temp_dir = TempDir::new().unwrap();
        let dumper = dumper("echo \"cannot use $DATABASE_URL\" >&2; exit 1");

        let err = dumper.dump(&credential(), temp_dir.path()).await.unwrap_err();
        let message = err.to_string();
        assert!(!message.contains("s3cret"));
        assert!(message.contains("<redacted>"));
    }

    #[tokio::test]
    async fn test_missing_program_fails_to_spawn() {
        let temp_dir = TempDir::new().unwrap();
        let dumper = CommandDumper::new(&DumpConfig {
            program: "/nonexistent/pg_dump".to_string(),
            ..DumpConfig::default()
        });

        let result = dumper.dump(&credential(), temp_dir.path()).await;
        assert!(matches!(result, Err(DumpError::Spawn { .. })));
    }
}
