//! Diff-Match-Patch patch application.
//!
//! Collaborative edits arrive as `text/x-dmp-patch` bodies: the standard
//! DMP patch text format (`@@ -l,s +l,s @@` hunk headers followed by
//! `%`-encoded context/insert/delete lines). This module parses that
//! format and applies it against existing content. Patch *generation*
//! is the editor's job and never happens on this side.
//!
//! Application is position-with-context based: each hunk is applied at
//! its recorded location when the context matches there, otherwise at
//! the nearest exact occurrence of the context. No fuzzy (bitap)
//! matching; a hunk whose context cannot be found anywhere fails the
//! whole apply, which surfaces as a statement error on the edit event.

use snafu::{OptionExt as _, Snafu};

#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum PatchError {
    #[snafu(display("Malformed hunk header: `{header}`"))]
    MalformedHeader { header: String },
    #[snafu(display("Malformed hunk line: `{line}`"))]
    MalformedLine { line: String },
    #[snafu(display("Invalid %-encoding in `{line}`"))]
    BadEncoding { line: String },
    #[snafu(display("Hunk context not found in target text"))]
    ContextNotFound,
}

pub type PatchResult<T> = std::result::Result<T, PatchError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DiffOp {
    Equal,
    Insert,
    Delete,
}

#[derive(Debug, Clone)]
struct Hunk {
    /// Char offset into the source text (0-based).
    start1: usize,
    diffs: Vec<(DiffOp, String)>,
}

/// Parse DMP patch text into hunks.
fn parse(patch_text: &str) -> PatchResult<Vec<Hunk>> {
    let mut hunks: Vec<Hunk> = Vec::new();
    for line in patch_text.split('\n') {
        if line.is_empty() {
            continue;
        }
        if let Some(header) = line.strip_prefix("@@ ") {
            let header_body = header
                .strip_suffix(" @@")
                .context(MalformedHeaderSnafu { header: line })?;
            let (coords1, _coords2) = header_body
                .split_once(' ')
                .context(MalformedHeaderSnafu { header: line })?;
            let coords1 = coords1
                .strip_prefix('-')
                .context(MalformedHeaderSnafu { header: line })?;
            let (start1, _length1) = parse_coords(coords1)
                .ok_or_else(|| MalformedHeaderSnafu { header: line }.build())?;
            hunks.push(Hunk {
                start1,
                diffs: Vec::new(),
            });
            continue;
        }

        let hunk = hunks
            .last_mut()
            .ok_or_else(|| MalformedLineSnafu { line }.build())?;
        let op = match line.as_bytes()[0] {
            b' ' => DiffOp::Equal,
            b'+' => DiffOp::Insert,
            b'-' => DiffOp::Delete,
            _ => return MalformedLineSnafu { line }.fail(),
        };
        let text = percent_decode(&line[1..]).context(BadEncodingSnafu { line })?;
        hunk.diffs.push((op, text));
    }
    Ok(hunks)
}

/// DMP hunk coordinates: `N` means start `N-1`, length 1; `N,0` means
/// start `N`, length 0; `N,L` means start `N-1`, length `L`.
fn parse_coords(coords: &str) -> Option<(usize, usize)> {
    match coords.split_once(',') {
        None => {
            let start: usize = coords.parse().ok()?;
            Some((start.checked_sub(1)?, 1))
        }
        Some((start, "0")) => Some((start.parse().ok()?, 0)),
        Some((start, length)) => {
            let start: usize = start.parse().ok()?;
            Some((start.checked_sub(1)?, length.parse().ok()?))
        }
    }
}

fn percent_decode(encoded: &str) -> Option<String> {
    let bytes = encoded.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut at = 0;
    while at < bytes.len() {
        if bytes[at] == b'%' {
            let hex = bytes.get(at + 1..at + 3)?;
            let hex = std::str::from_utf8(hex).ok()?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            at += 3;
        } else {
            out.push(bytes[at]);
            at += 1;
        }
    }
    String::from_utf8(out).ok()
}

/// Apply `patch_text` to `text`, returning the patched result.
pub fn apply(patch_text: &str, text: &str) -> PatchResult<String> {
    let hunks = parse(patch_text)?;
    let mut chars: Vec<char> = text.chars().collect();
    // Shift of original coordinates caused by already-applied hunks
    let mut offset: isize = 0;

    for hunk in &hunks {
        let old: String = hunk
            .diffs
            .iter()
            .filter(|(op, _)| matches!(op, DiffOp::Equal | DiffOp::Delete))
            .map(|(_, text)| text.as_str())
            .collect();
        let new: String = hunk
            .diffs
            .iter()
            .filter(|(op, _)| matches!(op, DiffOp::Equal | DiffOp::Insert))
            .map(|(_, text)| text.as_str())
            .collect();

        let old_chars: Vec<char> = old.chars().collect();
        let new_chars: Vec<char> = new.chars().collect();

        let expected = hunk.start1 as isize + offset;
        let position = find_nearest(&chars, &old_chars, expected)?;

        chars.splice(position..position + old_chars.len(), new_chars.iter().copied());

        offset += (position as isize - expected)
            + (new_chars.len() as isize - old_chars.len() as isize);
    }

    Ok(chars.into_iter().collect())
}

/// The exact occurrence of `needle` closest to `expected`, or the
/// clamped expected position for an empty needle (pure insertion).
fn find_nearest(haystack: &[char], needle: &[char], expected: isize) -> PatchResult<usize> {
    let clamped = expected.clamp(0, haystack.len() as isize) as usize;
    if needle.is_empty() {
        return Ok(clamped);
    }
    if haystack.len() < needle.len() {
        return ContextNotFoundSnafu.fail();
    }

    let mut best: Option<usize> = None;
    for at in 0..=(haystack.len() - needle.len()) {
        if &haystack[at..at + needle.len()] == needle {
            let better = match best {
                Some(prev) => {
                    (at as isize - expected).abs() < (prev as isize - expected).abs()
                }
                None => true,
            };
            if better {
                best = Some(at);
            }
        }
    }
    best.context(ContextNotFoundSnafu)
}
