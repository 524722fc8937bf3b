//! Split long text into platform-sized messages without breaking fenced code
//! blocks.
//!
//! Lengths are counted in characters. A segment that starts inside a code
//! block gets a synthetic opening fence (same language tag) followed by
//! [`CONTINUED_MARKER`]; a segment that ends inside one gets a synthetic
//! closing fence. Every emitted segment therefore renders on its own. Limits
//! too small to carry a fence pair fall back to plain splitting.

/// Default platform message limit.
pub const DEFAULT_LIMIT: usize = 2000;

/// Annotation inserted after a re-opened fence.
pub const CONTINUED_MARKER: &str = "[code block continued]";

const FENCE: &str = "```";
const CLOSER: &str = "\n```";

#[derive(Default)]
struct FenceState {
    open: bool,
    lang: String,
}

impl FenceState {
    fn observe(&mut self, line: &str) {
        let t = line.trim_start();
        let Some(rest) = t.strip_prefix(FENCE) else {
            return;
        };
        if self.open {
            self.open = false;
            self.lang.clear();
        } else {
            self.open = true;
            self.lang = rest.trim().to_string();
        }
    }
}

/// Synthetic opening fence of a segment that starts inside a code block.
#[derive(Clone, Debug, PartialEq, Eq)]
struct Reopen {
    lang: String,
    /// Whether [`CONTINUED_MARKER`] follows the fence line.
    marker: bool,
}

impl Reopen {
    fn len(&self) -> usize {
        let marker = if self.marker {
            CONTINUED_MARKER.chars().count() + 1
        } else {
            0
        };
        FENCE.len() + self.lang.chars().count() + 1 + marker
    }
}

/// A segment's logical content plus the fence state at its edges.
struct RawSegment {
    body: String,
    reopen: Option<Reopen>,
    ends_open: bool,
}

/// Whether segments of `limit` can afford synthetic fences at all: a bare
/// re-opening fence must fit in a quarter of the limit.
fn fences_fit(limit: usize) -> bool {
    FENCE.len() + 1 <= limit / 4
}

/// Richest re-opening header that fits in a quarter of `limit`: language tag
/// and marker, then marker only, then the fence with its tag, then a bare fence.
fn reopen_header(limit: usize, fence: &FenceState) -> Option<Reopen> {
    if !fence.open || !fences_fit(limit) {
        return None;
    }
    let lang = fence.lang.clone();
    [
        Reopen { lang: lang.clone(), marker: true },
        Reopen { lang: String::new(), marker: true },
        Reopen { lang, marker: false },
    ]
    .into_iter()
    .find(|r| r.len() <= limit / 4)
    .or(Some(Reopen { lang: String::new(), marker: false }))
}

/// Characters left for content once the synthetic fences are reserved.
fn budget(limit: usize, reopen: Option<&Reopen>) -> usize {
    if !fences_fit(limit) {
        return limit;
    }
    let header = reopen.map(Reopen::len).unwrap_or(0);
    limit.saturating_sub(header + CLOSER.len()).max(1)
}

struct Accumulator {
    limit: usize,
    out: Vec<RawSegment>,
    cur: String,
    cur_len: usize,
    lines: usize,
    reopen: Option<Reopen>,
}

impl Accumulator {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            out: Vec::new(),
            cur: String::new(),
            cur_len: 0,
            lines: 0,
            reopen: None,
        }
    }

    fn budget(&self) -> usize {
        budget(self.limit, self.reopen.as_ref())
    }

    /// Close the current segment; the next one starts with `fence`'s state.
    fn cut(&mut self, fence: &FenceState) {
        self.out.push(RawSegment {
            body: std::mem::take(&mut self.cur),
            reopen: self.reopen.take(),
            ends_open: fence.open && fences_fit(self.limit),
        });
        self.cur_len = 0;
        self.lines = 0;
        self.reopen = reopen_header(self.limit, fence);
    }

    fn push_line(&mut self, line: &str, len: usize) {
        if self.lines > 0 {
            self.cur.push('\n');
            self.cur_len += 1;
        }
        self.cur.push_str(line);
        self.cur_len += len;
        self.lines += 1;
    }

    fn finish(mut self, fence: &FenceState) -> Vec<RawSegment> {
        if self.lines > 0 {
            self.cut(fence);
        }
        self.out
    }
}

/// Split `text` into segments of at most `limit` characters.
///
/// Input that already fits is returned unchanged as a single segment.
pub fn split_message(text: &str, limit: usize) -> Vec<String> {
    let limit = limit.max(1);
    if text.chars().count() <= limit {
        return vec![text.to_string()];
    }

    let mut acc = Accumulator::new(limit);
    let mut fence = FenceState::default();

    for line in text.split('\n') {
        let len = line.chars().count();
        let before = FenceState {
            open: fence.open,
            lang: fence.lang.clone(),
        };
        fence.observe(line);

        if acc.lines > 0 && acc.cur_len + 1 + len > acc.budget() {
            acc.cut(&before);
        }

        if len <= acc.budget() {
            acc.push_line(line, len);
            continue;
        }

        // A single line longer than a whole segment: hard-split it.
        let mut rest = line;
        while !rest.is_empty() {
            let (piece, tail) = split_at_char(rest, acc.budget());
            acc.push_line(piece, piece.chars().count());
            if !tail.is_empty() {
                acc.cut(&fence);
            }
            rest = tail;
        }
    }

    acc.finish(&fence)
        .into_iter()
        .map(patch_fences)
        .filter(|s| !s.trim().is_empty())
        .collect()
}

fn patch_fences(seg: RawSegment) -> String {
    let mut out = String::with_capacity(seg.body.len() + 48);
    if let Some(reopen) = &seg.reopen {
        out.push_str(FENCE);
        out.push_str(&reopen.lang);
        out.push('\n');
        if reopen.marker {
            out.push_str(CONTINUED_MARKER);
            out.push('\n');
        }
    }
    out.push_str(&seg.body);
    if seg.ends_open {
        out.push_str(CLOSER);
    }
    out
}

fn split_at_char(s: &str, n: usize) -> (&str, &str) {
    match s.char_indices().nth(n) {
        Some((idx, _)) => s.split_at(idx),
        None => (s, ""),
    }
}
