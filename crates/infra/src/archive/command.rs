use std::fs;
use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use tracing::{debug, warn};

use lcbackup_core::{default_archive_filename, BackupOptions, Course, CourseId, Deadline};

use super::{Archive, ArchiveError, ArchiveService};
use crate::blob::{Blob, BlobStore, ARCHIVE_COMPONENT};

/// Archive engine driven through an external program.
///
/// The configured command line gets these arguments appended:
///
/// ```text
/// backup --course <id> --options <json> --output <path>
/// restore --input <path>          (prints the new course id on stdout)
/// ```
pub struct CommandArchiveService {
    command: Vec<String>,
    blobs: Arc<dyn BlobStore>,
    poll_interval: Duration,
}

struct EngineOutput {
    status: ExitStatus,
    stdout: String,
    stderr: String,
}

impl EngineOutput {
    fn check(self) -> Result<String, ArchiveError> {
        if self.status.success() {
            Ok(self.stdout)
        } else {
            Err(ArchiveError::Engine(format!("{}: {}", self.status, self.stderr.trim())))
        }
    }
}

fn drain(pipe: Option<impl Read + Send + 'static>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut out = String::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_string(&mut out);
        }
        out
    })
}

impl CommandArchiveService {
    pub fn new(command: Vec<String>, blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            command,
            blobs,
            poll_interval: Duration::from_millis(50),
        }
    }

    fn spawn(&self, args: &[&str]) -> Result<Child, ArchiveError> {
        let (program, leading) = self
            .command
            .split_first()
            .ok_or_else(|| ArchiveError::Engine("archive command is empty".to_string()))?;
        Command::new(program)
            .args(leading)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ArchiveError::Engine(format!("cannot start {program}: {e}")))
    }

    /// Run the engine to completion or kill it at `deadline`.
    fn run(&self, args: &[&str], deadline: Deadline) -> Result<EngineOutput, ArchiveError> {
        let mut child = self.spawn(args)?;
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if deadline.is_expired() {
                warn!(args = ?args, "archive engine timed out, killing it");
                let _ = child.kill();
                let _ = child.wait();
                return Err(ArchiveError::Timeout);
            }
            thread::sleep(self.poll_interval.min(deadline.remaining()));
        };

        Ok(EngineOutput {
            status,
            stdout: stdout.join().unwrap_or_default(),
            stderr: stderr.join().unwrap_or_default(),
        })
    }
}

fn path_arg(path: &Path) -> Result<&str, ArchiveError> {
    path.to_str()
        .ok_or_else(|| ArchiveError::Io(format!("non utf-8 path: {}", path.display())))
}

impl ArchiveService for CommandArchiveService {
    fn create_archive(
        &self,
        course: &Course,
        options: &BackupOptions,
        deadline: Deadline,
    ) -> Result<Archive, ArchiveError> {
        let filename = default_archive_filename(course, options, Utc::now());
        let workdir = tempfile::tempdir()?;
        let output = workdir.path().join(&filename);
        let options_json =
            serde_json::to_string(options).map_err(|e| ArchiveError::Engine(e.to_string()))?;
        let course_id = course.id.to_string();

        self.run(
            &[
                "backup",
                "--course",
                &course_id,
                "--options",
                &options_json,
                "--output",
                path_arg(&output)?,
            ],
            deadline,
        )?
        .check()?;

        let content = match fs::read(&output) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ArchiveError::Engine("engine exited without writing an archive".to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let blob = self.blobs.save(ARCHIVE_COMPONENT, &filename, Bytes::from(content))?;
        debug!(course_id = %course.id, blob_id = %blob.id, size = blob.metadata.size_bytes, "archive created");
        Ok(Archive::from_blob(&blob, course.id))
    }

    fn restore_archive(&self, blob: &Blob, deadline: Deadline) -> Result<CourseId, ArchiveError> {
        let workdir = tempfile::tempdir()?;
        let input = workdir.path().join(&blob.metadata.filename);
        fs::write(&input, &blob.content)?;

        let stdout = self.run(&["restore", "--input", path_arg(&input)?], deadline)?.check()?;
        stdout
            .trim()
            .parse::<CourseId>()
            .map_err(|e| ArchiveError::InvalidArchive(format!("engine returned no course id: {e}")))
    }
}
