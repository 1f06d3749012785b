//! `append` suffixes every byte buffer with a fixed string. Built on
//! the buffer adapter.

use crate::errors::CompileError;
use crate::procbuffer::{BufferKid, BufferState};

pub struct AppendKid;

impl BufferKid for AppendKid {
    fn name(&self) -> &'static str {
        "append"
    }

    fn pass_not_found(&self) -> bool {
        true
    }

    fn init(&self, args: &[String]) -> Result<Box<dyn BufferState>, CompileError> {
        let suffix = args.first().cloned().unwrap_or_default();
        Ok(Box::new(AppendState {
            suffix: suffix.into_bytes(),
        }))
    }
}

struct AppendState {
    suffix: Vec<u8>,
}

impl BufferState for AppendState {
    fn decode(&mut self, buf: &[u8]) -> Option<Vec<u8>> {
        if self.suffix.is_empty() {
            return None;
        }
        let mut out = Vec::with_capacity(buf.len() + self.suffix.len());
        out.extend_from_slice(buf);
        out.extend_from_slice(&self.suffix);
        Some(out)
    }
}
