//! JSONL result streams.
//!
//! Format: an optional first line `{"metadata": {...}}`, then one record per
//! line. The same reader serves question sets and result streams.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::types::{RunMetadata, TestResult};
use crate::error::{EngineError, EngineResult};
use crate::orchestrator::ResultObserver;
use crate::question::Question;

#[derive(Serialize)]
struct Header<'a> {
    metadata: &'a RunMetadata,
}

/// Write a complete result stream, replacing `path` only once fully written.
pub fn write_stream(
    path: impl AsRef<Path>,
    metadata: &RunMetadata,
    results: &[TestResult],
) -> EngineResult<()> {
    let path = path.as_ref();
    ensure_parent(path)?;
    let temp_path = sibling(path, "tmp");

    {
        let mut out = BufWriter::new(File::create(&temp_path)?);
        serde_json::to_writer(&mut out, &Header { metadata })?;
        out.write_all(b"\n")?;
        for r in results {
            serde_json::to_writer(&mut out, r)?;
            out.write_all(b"\n")?;
        }
        out.flush()?;
    }

    fs::rename(&temp_path, path)?;
    debug!(path = %path.display(), records = results.len(), "result stream written");
    Ok(())
}

/// Read a result stream. A header that is not a [`RunMetadata`] (e.g. from an
/// older tool) is reported as `None`.
pub fn read_stream(path: impl AsRef<Path>) -> EngineResult<(Option<RunMetadata>, Vec<TestResult>)> {
    let path = path.as_ref();
    let (header, results) = read_jsonl::<TestResult>(path)?;
    let metadata = match header {
        Some(value) => match serde_json::from_value::<RunMetadata>(value) {
            Ok(m) => Some(m),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unrecognised stream header ignored");
                None
            }
        },
        None => None,
    };
    Ok((metadata, results))
}

/// Read a question set and its upstream metadata object.
pub fn read_questions(path: impl AsRef<Path>) -> EngineResult<(Option<Value>, Vec<Question>)> {
    read_jsonl(path.as_ref())
}

/// Lines are decoded as raw bytes so that a final record cut inside a
/// multi-byte character is skipped like any other truncated record.
fn read_jsonl<T: DeserializeOwned>(path: &Path) -> EngineResult<(Option<Value>, Vec<T>)> {
    let raw = fs::read(path)?;
    let lines: Vec<(usize, &[u8])> = raw
        .split(|&b| b == b'\n')
        .enumerate()
        .map(|(i, line)| (i + 1, line.strip_suffix(b"\r").unwrap_or(line)))
        .filter(|(_, line)| !line.iter().all(u8::is_ascii_whitespace))
        .collect();

    let mut header = None;
    let mut body = &lines[..];
    if let Some((_, first)) = lines.first() {
        if let Ok(Value::Object(mut map)) = serde_json::from_slice::<Value>(first) {
            if let Some(meta) = map.remove("metadata") {
                header = Some(meta);
                body = &lines[1..];
            }
        }
    }

    let mut records = Vec::with_capacity(body.len());
    for (pos, (line_no, line)) in body.iter().enumerate() {
        match serde_json::from_slice::<T>(line) {
            Ok(record) => records.push(record),
            Err(e) if pos + 1 == body.len() => {
                warn!(
                    path = %path.display(),
                    line = line_no,
                    error = %e,
                    "skipping truncated final record"
                );
            }
            Err(e) => return Err(EngineError::malformed_stream(path, *line_no, e.to_string())),
        }
    }

    Ok((header, records))
}

/// Append-only sink that persists each result as soon as it completes.
///
/// Lines land in completion order. After a crash the file is a valid
/// recovery input; after a normal finish [`CheckpointWriter::finish`] removes it.
pub struct CheckpointWriter {
    path: PathBuf,
    out: Mutex<BufWriter<File>>,
}

impl CheckpointWriter {
    /// Checkpoint path used for a given final output path.
    pub fn path_for(output: impl AsRef<Path>) -> PathBuf {
        sibling(output.as_ref(), "partial")
    }

    /// Create (truncating) the checkpoint and write the metadata header.
    pub fn create(path: impl AsRef<Path>, metadata: &RunMetadata) -> EngineResult<Self> {
        let path = path.as_ref().to_path_buf();
        ensure_parent(&path)?;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        let mut out = BufWriter::new(file);
        serde_json::to_writer(&mut out, &Header { metadata })?;
        out.write_all(b"\n")?;
        out.flush()?;
        Ok(Self {
            path,
            out: Mutex::new(out),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, result: &TestResult) -> EngineResult<()> {
        let line = serde_json::to_string(result)?;
        let mut out = self
            .out
            .lock()
            .map_err(|_| std::io::Error::other("checkpoint writer poisoned"))?;
        out.write_all(line.as_bytes())?;
        out.write_all(b"\n")?;
        out.flush()?;
        Ok(())
    }

    /// Remove the checkpoint after the final stream has been written.
    pub fn finish(self) -> EngineResult<()> {
        drop(self.out);
        fs::remove_file(&self.path)?;
        Ok(())
    }
}

impl ResultObserver for CheckpointWriter {
    fn on_result(&self, index: usize, result: &TestResult) {
        if let Err(e) = self.append(result) {
            warn!(
                case = index,
                path = %self.path.display(),
                error = %e,
                "checkpoint append failed"
            );
        }
    }
}

fn ensure_parent(path: &Path) -> EngineResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(format!(".{suffix}"));
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn question_set_header_is_split_off() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("questions.jsonl");
        let mut f = File::create(&path).unwrap();
        writeln!(f, r#"{{"metadata": {{"novel": "hp1.txt", "count": 1}}}}"#).unwrap();
        writeln!(
            f,
            r#"{{"question": "q", "question_type": "single_choice", "choice": {{"a": "x", "b": "y"}}, "answer": ["a"], "position": {{"start_pos": 3, "end_pos": 9}}}}"#
        )
        .unwrap();
        writeln!(f).unwrap();

        let (meta, qs) = read_questions(&path).unwrap();
        assert_eq!(meta.unwrap()["novel"], "hp1.txt");
        assert_eq!(qs.len(), 1);
        assert_eq!(qs[0].position.end_pos, 9);
    }

    #[test]
    fn file_without_header_reads_every_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("q.jsonl");
        fs::write(
            &path,
            concat!(
                r#"{"question": "q1", "question_type": "single_choice", "choice": {"a": "x", "b": "y"}, "answer": ["a"], "position": {"start_pos": 0, "end_pos": 1}}"#,
                "\n",
                r#"{"question": "q2", "question_type": "single_choice", "choice": {"a": "x", "b": "y"}, "answer": ["b"], "position": {"start_pos": 2, "end_pos": 3}}"#,
                "\n"
            ),
        )
        .unwrap();
        let (meta, qs) = read_questions(&path).unwrap();
        assert!(meta.is_none());
        assert_eq!(qs.len(), 2);
    }

    #[test]
    fn malformed_interior_line_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.jsonl");
        fs::write(
            &path,
            concat!(
                "{\"metadata\": {}}\n",
                "not json\n",
                r#"{"question": "q", "question_type": "single_choice", "choice": {"a": "x", "b": "y"}, "answer": ["a"], "position": {"start_pos": 0, "end_pos": 1}}"#,
                "\n"
            ),
        )
        .unwrap();
        let err = read_questions(&path).unwrap_err();
        match err {
            EngineError::MalformedStream { line, .. } => assert_eq!(line, 2),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn invalid_utf8_inside_the_stream_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.jsonl");
        let good = r#"{"question": "q", "question_type": "single_choice", "choice": {"a": "x", "b": "y"}, "answer": ["a"], "position": {"start_pos": 0, "end_pos": 1}}"#;
        let mut bytes = b"{\"metadata\": {}}\r\n".to_vec();
        bytes.extend_from_slice(b"{\"question\": \"\xe5\x93\"}\n");
        bytes.extend_from_slice(good.as_bytes());
        bytes.push(b'\n');
        fs::write(&path, bytes).unwrap();

        match read_questions(&path).unwrap_err() {
            EngineError::MalformedStream { line, .. } => assert_eq!(line, 2),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn sibling_paths_keep_the_full_name() {
        let p = Path::new("/tmp/out/results.jsonl");
        assert_eq!(sibling(p, "tmp"), PathBuf::from("/tmp/out/results.jsonl.tmp"));
        assert_eq!(
            CheckpointWriter::path_for(p),
            PathBuf::from("/tmp/out/results.jsonl.partial")
        );
    }
}
