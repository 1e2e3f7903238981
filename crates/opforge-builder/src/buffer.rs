//! Growable bytecode buffer and its parallel arrays.

/// One entry of per-instruction source-location tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceInfoEntry {
    pub bci: u32,
    pub start_offset: u32,
    pub length: u32,
}

/// One exception-handler table entry: `(startBci, endBci, handlerBci,
/// startSp, excLocalIdx)`, packed as 5 ints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionHandlerEntry {
    pub start_bci: u32,
    pub end_bci: u32,
    pub handler_bci: u32,
    pub start_sp: u32,
    pub exc_local_idx: u32,
}

impl ExceptionHandlerEntry {
    /// Flatten to the on-disk `[u32; 5]` layout.
    pub fn to_flat(self) -> [u32; 5] {
        [
            self.start_bci,
            self.end_bci,
            self.handler_bci,
            self.start_sp,
            self.exc_local_idx,
        ]
    }
}

/// Append-only array of 16-bit words plus the source-info, exception-handler
/// and (optional) basic-block-boundary arrays that travel alongside it.
///
/// Resize is amortized doubling, same as `Vec::push`; there is nothing
/// custom to implement there. Addressing is at 16-bit granularity rather
/// than bytes, since every immediate is a full word.
#[derive(Debug, Clone, Default)]
pub struct BytecodeBuffer {
    code: Vec<u16>,
    source_info: Vec<SourceInfoEntry>,
    ex_handlers: Vec<ExceptionHandlerEntry>,
    /// One longer than `code` once allocated, so a boundary can be marked
    /// before any instruction exists at that bci.
    basic_block_boundary: Option<Vec<bool>>,
}

impl BytecodeBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tracing(trace_basic_blocks: bool) -> Self {
        let mut buf = Self::default();
        if trace_basic_blocks {
            buf.basic_block_boundary = Some(vec![false]);
        }
        buf
    }

    /// Current bci: the position the next emitted instruction will occupy.
    pub fn current_bci(&self) -> u32 {
        self.code.len() as u32
    }

    pub fn code(&self) -> &[u16] {
        &self.code
    }

    pub fn source_info(&self) -> &[SourceInfoEntry] {
        &self.source_info
    }

    pub fn exception_handlers(&self) -> &[ExceptionHandlerEntry] {
        &self.ex_handlers
    }

    /// Append a single word, returning the bci it was written at.
    pub fn emit_word(&mut self, word: u16) -> u32 {
        let bci = self.current_bci();
        self.code.push(word);
        if let Some(boundaries) = &mut self.basic_block_boundary {
            boundaries.push(false);
        }
        bci
    }

    /// Read back a word (used when patching forward-branch immediates).
    pub fn read_word(&self, bci: u32) -> u16 {
        self.code[bci as usize]
    }

    /// Overwrite a word in place (label resolution, finally-handler copy
    /// fixups, and quickening rewrites all go through this).
    pub fn patch_word(&mut self, bci: u32, word: u16) {
        self.code[bci as usize] = word;
    }

    pub fn push_source_info(&mut self, entry: SourceInfoEntry) {
        self.source_info.push(entry);
    }

    pub fn push_exception_handler(&mut self, entry: ExceptionHandlerEntry) {
        self.ex_handlers.push(entry);
    }

    pub fn mark_basic_block_boundary(&mut self, bci: u32) {
        if let Some(boundaries) = &mut self.basic_block_boundary {
            if (bci as usize) < boundaries.len() {
                boundaries[bci as usize] = true;
            }
        }
    }

    /// Splice another buffer's code (and its parallel arrays, offset by the
    /// current length) into this one, used by finally-handler replay to
    /// duplicate a handler body inline.
    pub fn append_buffer(&mut self, other: &BytecodeBuffer) -> u32 {
        let offset = self.current_bci();
        self.code.extend_from_slice(&other.code);
        if let Some(boundaries) = &mut self.basic_block_boundary {
            boundaries.resize(self.code.len() + 1, false);
        }
        for entry in &other.source_info {
            self.source_info.push(SourceInfoEntry {
                bci: entry.bci + offset,
                ..*entry
            });
        }
        for entry in &other.ex_handlers {
            self.ex_handlers.push(ExceptionHandlerEntry {
                start_bci: entry.start_bci + offset,
                end_bci: entry.end_bci + offset,
                handler_bci: entry.handler_bci + offset,
                ..*entry
            });
        }
        offset
    }

    /// Swap this buffer's mutable state out for `replacement`, returning
    /// what was there before. Used by `beginFinallyTry` to redirect
    /// emission into a fresh buffer and `endFinallyTry` to restore it.
    pub fn swap(&mut self, replacement: BytecodeBuffer) -> BytecodeBuffer {
        std::mem::replace(self, replacement)
    }
}
