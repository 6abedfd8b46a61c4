//! Restartable decompression checkpoints for gzip streams.
//!
//! The heavy lifting is delegated to the external `gztool` binary, which
//! builds and consumes the position-seekable `.gzi` index format. The index
//! artifact is stored verbatim in the object store and can be re-inspected by
//! any later process; everything this module knows about its internals is the
//! `(number, compressed, uncompressed)` triple reported per checkpoint.

use std::path::Path;
use std::process::Stdio;

use regex::Regex;
use snafu::{ensure, ResultExt};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use crate::{error, Result};

/// One restartable checkpoint in a compressed layer. Offsets are the tool's
/// 1-based compressed positions: the first span sits at the end of the gzip
/// header, not at zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    /// 1-based ordinal
    pub number: u32,
    /// Compressed stream position at which decompression may restart
    pub compressed: u64,
    /// Corresponding position in the decompressed stream
    pub uncompressed: u64,
}

/// A running index-builder process: compressed bytes go into `stdin`, the
/// decompressed stream comes out of `stdout`, and the `.gzi` index file is
/// written as a side effect.
pub struct IndexerProcess {
    child: Child,
}

impl IndexerProcess {
    /// Spawn the index builder writing to `index_path`. `span_mib` overrides
    /// the spacing between checkpoints (the tool defaults to 10 MiB).
    pub fn spawn(index_path: &Path, span_mib: Option<u32>) -> Result<Self> {
        let mut cmd = Command::new("gztool");
        cmd.arg("-I").arg(index_path).arg("-b").arg("0");
        if let Some(span) = span_mib {
            cmd.arg("-s").arg(span.to_string());
        }
        let child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(map_spawn_error)?;
        Ok(Self { child })
    }

    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.child.stdin.take()
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    /// Wait for the tool to finish; a non-zero exit means the compressed
    /// stream could not be fully decoded.
    pub async fn wait(&mut self) -> Result<()> {
        let status = self.child.wait().await.context(error::IndexToolSnafu)?;
        ensure!(
            status.success(),
            error::CorruptStreamSnafu {
                reason: format!("index builder exited with {status}"),
            }
        );
        Ok(())
    }

    /// Kill the tool without waiting for the stream to finish. Used on
    /// cancellation; the partially written index file is unlinked by the
    /// caller dropping its staging directory.
    pub async fn abort(&mut self) {
        let _ = self.child.kill().await;
    }
}

/// Re-inspect a stored index artifact and list its checkpoints.
pub async fn list_spans(index_path: &Path) -> Result<Vec<Span>> {
    let output = Command::new("gztool")
        .arg("-ll")
        .arg(index_path)
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .await
        .map_err(map_spawn_error)?;
    ensure!(
        output.status.success(),
        error::CorruptStreamSnafu {
            reason: format!("index inspection exited with {}", output.status),
        }
    );

    let stdout = String::from_utf8_lossy(output.stdout.as_slice());
    let re = Regex::new(r"#(\d+): @ (\d+) / (\d+)").unwrap();
    let mut spans = Vec::new();
    for capture in re.captures_iter(stdout.as_ref()) {
        spans.push(Span {
            number: capture[1].parse().unwrap_or_default(),
            compressed: capture[2].parse().unwrap_or_default(),
            uncompressed: capture[3].parse().unwrap_or_default(),
        });
    }
    spans.sort_by_key(|s| s.uncompressed);

    ensure!(
        !spans.is_empty(),
        error::CorruptStreamSnafu {
            reason: format!("no checkpoints listed in index {index_path:?}"),
        }
    );
    Ok(spans)
}

/// Decode exactly `length` uncompressed bytes starting at
/// `uncompressed_offset`, reading a compressed source whose first byte
/// corresponds to position `skip` (1-based) in the original stream.
pub async fn extract<R>(
    mut gz: R,
    index_path: &Path,
    skip: u64,
    uncompressed_offset: u64,
    length: u64,
) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    if length == 0 {
        return Ok(Vec::new());
    }

    let mut child = Command::new("gztool")
        .arg("-I")
        .arg(index_path)
        .arg("-n")
        .arg(skip.to_string())
        .arg("-b")
        .arg(uncompressed_offset.to_string())
        .arg("-r")
        .arg(length.to_string())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(map_spawn_error)?;

    let mut stdin = child.stdin.take().expect("stdin was piped");
    let mut stdout = child.stdout.take().expect("stdout was piped");

    // The tool exits as soon as it has produced the requested bytes, which
    // surfaces here as a broken pipe on the writing side; that is the normal
    // end of a ranged extraction, so pump errors are not reported directly.
    let pump = async {
        let _ = tokio::io::copy(&mut gz, &mut stdin).await;
        drop(stdin);
    };
    let read = async {
        let mut decoded = Vec::new();
        let result = stdout.read_to_end(&mut decoded).await;
        (decoded, result)
    };
    let ((decoded, read_result), ()) = tokio::join!(read, pump);
    read_result.context(error::IndexToolSnafu)?;
    let status = child.wait().await.context(error::IndexToolSnafu)?;

    ensure!(
        decoded.len() as u64 >= length,
        error::TruncatedSnafu {
            expected: length,
            actual: decoded.len() as u64,
        }
    );
    ensure!(
        status.success(),
        error::CorruptStreamSnafu {
            reason: format!("extraction exited with {status}"),
        }
    );
    Ok(decoded)
}

/// Select the checkpoints covering the uncompressed range
/// `[offset, offset + size)`: the first span is the last checkpoint at or
/// before `offset`, the last span is the last checkpoint at or before
/// `offset + size`. Returns indices into `spans`.
pub fn span_range(spans: &[Span], offset: u64, size: u64) -> Result<(usize, usize)> {
    let first = spans.partition_point(|s| s.uncompressed <= offset);
    ensure!(first > 0, error::OffsetNotIndexedSnafu { offset });
    let first = first - 1;
    let last = spans.partition_point(|s| s.uncompressed <= offset + size) - 1;
    Ok((first, last))
}

/// The compressed byte range needed to decode everything the spans at
/// `[first, last]` cover: from the first span's restart position to the next
/// checkpoint after the last (or the end of the blob when there is none).
pub fn compressed_range(spans: &[Span], first: usize, last: usize) -> (u64, Option<u64>) {
    (
        spans[first].compressed,
        spans.get(last + 1).map(|s| s.compressed),
    )
}

/// The span ordinals for an index range, as stored on file index entries.
pub fn span_numbers(spans: &[Span], first: usize, last: usize) -> Vec<u32> {
    spans[first..=last].iter().map(|s| s.number).collect()
}

fn map_spawn_error(source: std::io::Error) -> error::Error {
    if source.kind() == std::io::ErrorKind::NotFound {
        error::Error::IndexToolMissing
    } else {
        error::Error::IndexTool { source }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    // Checkpoint shape lifted from a real index listing
    fn spans() -> Vec<Span> {
        vec![
            Span {
                number: 1,
                compressed: 10,
                uncompressed: 0,
            },
            Span {
                number: 2,
                compressed: 3110140,
                uncompressed: 10485897,
            },
            Span {
                number: 3,
                compressed: 6568507,
                uncompressed: 20989348,
            },
        ]
    }

    #[test]
    fn test_single_span_file() {
        let spans = spans();
        let (first, last) = span_range(&spans, 15697408, 1314).unwrap();
        assert_eq!((first, last), (1, 1));
        assert_eq!(span_numbers(&spans, first, last), vec![2]);
        assert_eq!(
            compressed_range(&spans, first, last),
            (3110140, Some(6568507))
        );
    }

    #[test]
    fn test_zero_byte_file() {
        let spans = spans();
        let (first, last) = span_range(&spans, 512, 0).unwrap();
        assert_eq!((first, last), (0, 0));
        assert_eq!(span_numbers(&spans, first, last), vec![1]);
    }

    #[test]
    fn test_zero_byte_file_on_checkpoint() {
        let spans = spans();
        let (first, last) = span_range(&spans, 10485897, 0).unwrap();
        assert_eq!((first, last), (1, 1));
    }

    #[test]
    fn test_file_crossing_checkpoints() {
        let spans = spans();
        // Crosses one checkpoint: needs two spans
        let (first, last) = span_range(&spans, 0, 10485897).unwrap();
        assert_eq!((first, last), (0, 1));
        assert_eq!(span_numbers(&spans, first, last), vec![1, 2]);
        // Crosses both checkpoints: needs all three and reads to EOF
        let (first, last) = span_range(&spans, 0, 20989348).unwrap();
        assert_eq!((first, last), (0, 2));
        assert_eq!(compressed_range(&spans, first, last), (10, None));
    }

    #[test]
    fn test_tail_of_last_span_is_unbounded() {
        let spans = spans();
        let (first, last) = span_range(&spans, 20989400, 4096).unwrap();
        assert_eq!((first, last), (2, 2));
        assert_eq!(compressed_range(&spans, first, last), (6568507, None));
    }

    #[test]
    fn test_offset_before_first_checkpoint() {
        let spans = vec![Span {
            number: 1,
            compressed: 10,
            uncompressed: 100,
        }];
        assert!(matches!(
            span_range(&spans, 50, 10),
            Err(crate::error::Error::OffsetNotIndexed { offset: 50 })
        ));
    }
}
