//! Chunked copy with percent progress reporting, shared by the drivers.

use crate::ProgressFn;
use std::io::{Read, Write};

const CHUNK: usize = 64 * 1024;

/// Copy `reader` to `writer`, invoking `progress` with a monotonically
/// non-decreasing percentage that always ends at 100.
pub(crate) fn copy_with_progress<R: Read, W: Write>(
    reader: &mut R,
    writer: &mut W,
    total: u64,
    progress: Option<&ProgressFn>,
) -> std::io::Result<u64> {
    let mut buf = vec![0u8; CHUNK];
    let mut done: u64 = 0;
    let mut last_pct: u8 = 0;
    if let Some(cb) = progress {
        cb(0);
    }
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n])?;
        done += n as u64;
        if let Some(cb) = progress {
            let pct = if total == 0 {
                100
            } else {
                ((done.saturating_mul(100)) / total).min(100) as u8
            };
            if pct > last_pct {
                last_pct = pct;
                cb(pct);
            }
        }
    }
    writer.flush()?;
    if let Some(cb) = progress {
        if last_pct < 100 {
            cb(100);
        }
    }
    Ok(done)
}
