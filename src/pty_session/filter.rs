//! Streaming escape filter for the server console.
//!
//! Wine decorates the console with cursor cosmetics and reports the server status by
//! rewriting the terminal title. The filter strips the cosmetics, pulls title payloads
//! out into a side channel, and passes everything else through byte for byte. State
//! survives across `process` calls because a sequence may straddle two reads.

/// Bytes read from the terminal per event (also the maximum length of a title).
pub const CHUNK_SIZE: usize = 256;

/// Titles longer than this are truncated; the rest is discarded up to the terminator.
pub const TITLE_MAX: usize = CHUNK_SIZE;

const ESC: u8 = 0x1B;
const BEL: u8 = 0x07;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FilterState {
    Normal,
    /// `ESC`
    SawEsc,
    /// `ESC ]`
    SawOsc,
    /// `ESC ] 0`
    SawOsc0,
    /// `ESC ] 0 ;` and collecting the title.
    InTitle,
    /// Title hit `TITLE_MAX`; dropping bytes until the terminator.
    TitleOverflow,
    /// `ESC [`
    SawCsi,
    /// `ESC [ ?`
    SawCsiPrivate,
    /// `ESC [ ? 2`
    SawCsiPrivate2,
    /// `ESC [ ? 2 5`
    SawCsiPrivate25,
    /// `ESC [ 1`
    SawCsi1,
}

/// Escape/title state machine over the raw terminal stream.
#[derive(Debug)]
pub struct OutputFilter {
    state: FilterState,
    /// Bytes consumed while tentatively matching; replayed verbatim on mismatch.
    pending: Vec<u8>,
    title: Vec<u8>,
    out: Vec<u8>,
}

impl Default for OutputFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputFilter {
    pub fn new() -> Self {
        Self {
            state: FilterState::Normal,
            pending: Vec::with_capacity(8),
            title: Vec::with_capacity(TITLE_MAX),
            out: Vec::with_capacity(CHUNK_SIZE * 2 + 32),
        }
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> FilterState {
        self.state
    }

    /// Filter one chunk. Completed titles are handed to `on_title` as soon as their
    /// terminator is seen; the returned slice is the cleaned output for this chunk.
    pub fn process<'a, F>(&'a mut self, chunk: &'a [u8], mut on_title: F) -> &'a [u8]
    where
        F: FnMut(&[u8]),
    {
        if self.state == FilterState::Normal && !chunk.contains(&ESC) {
            return chunk;
        }

        self.out.clear();
        for &byte in chunk {
            self.step(byte, &mut on_title);
        }
        &self.out
    }

    fn step<F>(&mut self, byte: u8, on_title: &mut F)
    where
        F: FnMut(&[u8]),
    {
        match self.state {
            FilterState::Normal => self.normal(byte),
            FilterState::SawEsc => match byte {
                b']' => self.advance(FilterState::SawOsc, byte),
                b'[' => self.advance(FilterState::SawCsi, byte),
                _ => self.mismatch(byte),
            },
            FilterState::SawOsc => match byte {
                b'0' => self.advance(FilterState::SawOsc0, byte),
                _ => self.mismatch(byte),
            },
            FilterState::SawOsc0 => match byte {
                b';' => {
                    self.pending.clear();
                    self.title.clear();
                    self.state = FilterState::InTitle;
                }
                _ => self.mismatch(byte),
            },
            FilterState::InTitle => match byte {
                BEL => {
                    on_title(&self.title);
                    self.title.clear();
                    self.state = FilterState::Normal;
                }
                ESC => {
                    // an unterminated title never reaches the side channel
                    self.title.clear();
                    self.begin_escape();
                }
                _ if self.title.len() < TITLE_MAX => self.title.push(byte),
                _ => {
                    on_title(&self.title);
                    self.title.clear();
                    self.state = FilterState::TitleOverflow;
                }
            },
            FilterState::TitleOverflow => match byte {
                BEL => self.state = FilterState::Normal,
                ESC => self.begin_escape(),
                _ => {}
            },
            FilterState::SawCsi => match byte {
                b'?' => self.advance(FilterState::SawCsiPrivate, byte),
                b'1' => self.advance(FilterState::SawCsi1, byte),
                // erase to end of line; wine uses it as a carriage-return stand-in
                b'K' => self.discard(),
                _ => self.mismatch(byte),
            },
            FilterState::SawCsiPrivate => match byte {
                b'2' => self.advance(FilterState::SawCsiPrivate2, byte),
                _ => self.mismatch(byte),
            },
            FilterState::SawCsiPrivate2 => match byte {
                b'5' => self.advance(FilterState::SawCsiPrivate25, byte),
                _ => self.mismatch(byte),
            },
            FilterState::SawCsiPrivate25 => match byte {
                b'h' | b'l' => self.discard(),
                _ => self.mismatch(byte),
            },
            FilterState::SawCsi1 => match byte {
                b'C' => {
                    self.discard();
                    self.out.push(b' ');
                }
                _ => self.mismatch(byte),
            },
        }
    }

    fn normal(&mut self, byte: u8) {
        if byte == ESC {
            self.begin_escape();
        } else {
            self.out.push(byte);
        }
    }

    fn begin_escape(&mut self) {
        self.pending.clear();
        self.pending.push(ESC);
        self.state = FilterState::SawEsc;
    }

    fn advance(&mut self, next: FilterState, byte: u8) {
        self.pending.push(byte);
        self.state = next;
    }

    fn discard(&mut self) {
        self.pending.clear();
        self.state = FilterState::Normal;
    }

    /// Replay the tentative prefix, then treat the deviating byte as ordinary input.
    fn mismatch(&mut self, byte: u8) {
        self.out.extend_from_slice(&self.pending);
        self.pending.clear();
        self.state = FilterState::Normal;
        self.normal(byte);
    }
}
