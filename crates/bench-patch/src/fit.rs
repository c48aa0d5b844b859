//! Locating a hunk in file content.
//!
//! Content is held as lines that keep their terminators, so joining them
//! reproduces the file byte for byte.

use crate::parse::{Hunk, LineKind};

const SIGNATURE_KEYWORDS: &[&str] = &[
    "def",
    "class",
    "fn",
    "impl",
    "struct",
    "enum",
    "trait",
    "function",
    "func",
    "interface",
    "module",
    "mod",
    "fun",
];

const SIGNATURE_MODIFIERS: &[&str] = &[
    "pub",
    "pub(crate)",
    "pub(super)",
    "async",
    "export",
    "default",
    "static",
    "public",
    "private",
    "protected",
    "abstract",
    "final",
    "unsafe",
    "const",
    "extern",
];

pub(crate) fn split_lines(text: &str) -> Vec<String> {
    text.split_inclusive('\n').map(str::to_string).collect()
}

pub(crate) fn join_lines(lines: &[String]) -> String {
    lines.concat()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Placement {
    /// Index of the first old line kept after context trimming.
    pub index: usize,
    pub trimmed_lead: usize,
    pub trimmed_trail: usize,
    pub exact_whitespace: bool,
}

impl Placement {
    pub(crate) fn exact(index: usize) -> Self {
        Self {
            index,
            trimmed_lead: 0,
            trimmed_trail: 0,
            exact_whitespace: true,
        }
    }
}

/// Candidate start positions for a search, inclusive on both ends.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Scope {
    pub expected: usize,
    pub lo: usize,
    pub hi: usize,
}

impl Scope {
    pub(crate) fn window(expected: usize, window: usize, floor: usize) -> Self {
        Self {
            expected,
            lo: expected.saturating_sub(window).max(floor),
            hi: expected.saturating_add(window),
        }
    }
}

pub(crate) fn vanilla_fit(lines: &[String], hunk: &Hunk, expected: usize) -> bool {
    let old = hunk.old_side();
    if expected.saturating_add(old.len()) > lines.len() {
        return false;
    }
    lines[expected..expected + old.len()]
        .iter()
        .zip(&old)
        .all(|(have, want)| have == want)
}

fn normalize_ws(line: &str) -> String {
    line.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn leading_context(hunk: &Hunk) -> usize {
    hunk.lines
        .iter()
        .take_while(|l| l.kind == LineKind::Context)
        .count()
}

fn trailing_context(hunk: &Hunk) -> usize {
    hunk.lines
        .iter()
        .rev()
        .take_while(|l| l.kind == LineKind::Context)
        .count()
}

/// Best placement within `scope`, dropping up to `fuzz` context lines from
/// each end. Candidates rank by fewer dropped lines, then exact whitespace,
/// then distance from the expected line, then the lowest line.
pub(crate) fn fuzzy_fit(lines: &[String], hunk: &Hunk, scope: Scope, fuzz: usize) -> Option<Placement> {
    let old = hunk.old_side();
    if old.is_empty() {
        let index = scope.expected.min(lines.len());
        return (index >= scope.lo).then(|| Placement::exact(index));
    }

    let lead_ctx = leading_context(hunk);
    let trail_ctx = trailing_context(hunk);
    let normalized: Vec<String> = lines.iter().map(|l| normalize_ws(l)).collect();
    let mut last_trim: Option<(usize, usize)> = None;

    for trim in 0..=fuzz {
        let lead = trim.min(lead_ctx);
        let trail = trim.min(trail_ctx).min(old.len() - lead);
        if last_trim == Some((lead, trail)) {
            continue;
        }
        last_trim = Some((lead, trail));
        let wanted = &old[lead..old.len() - trail];
        if wanted.is_empty() || wanted.len() > lines.len() {
            continue;
        }
        let wanted_norm: Vec<String> = wanted.iter().map(|l| normalize_ws(l)).collect();
        let expected = scope.expected.saturating_add(lead);
        let lo = scope.lo.saturating_add(lead);
        let hi = scope.hi.saturating_add(lead).min(lines.len() - wanted.len());

        let mut best: Option<(bool, usize, usize)> = None;
        let mut p = lo;
        while p <= hi {
            let window = &lines[p..p + wanted.len()];
            let exact = window.iter().zip(wanted).all(|(have, want)| have == want);
            let matched = exact
                || normalized[p..p + wanted.len()]
                    .iter()
                    .zip(&wanted_norm)
                    .all(|(have, want)| have == want);
            if matched {
                let rank = (!exact, p.abs_diff(expected), p);
                if best.map_or(true, |b| rank < b) {
                    best = Some(rank);
                }
            }
            p += 1;
        }
        if let Some((inexact, _, p)) = best {
            return Some(Placement {
                index: p,
                trimmed_lead: lead,
                trimmed_trail: trail,
                exact_whitespace: !inexact,
            });
        }
    }
    None
}

/// Re-anchors the hunk on the named construct it belongs to, found through
/// its `@@` section text or a signature line among its old lines.
pub(crate) fn structural_fit(
    lines: &[String],
    hunk: &Hunk,
    expected: usize,
    floor: usize,
    fuzz: usize,
) -> Option<Placement> {
    let mut anchors: Vec<(String, Option<usize>)> = Vec::new();
    if let Some(key) = signature_key(&hunk.section) {
        anchors.push((key, None));
    }
    for (k, line) in hunk.old_side().iter().enumerate() {
        if let Some(key) = signature_key(line) {
            anchors.push((key, Some(k)));
        }
    }

    for (key, offset_in_hunk) in anchors {
        let mut sites: Vec<usize> = lines
            .iter()
            .enumerate()
            .filter(|(idx, line)| *idx >= floor && signature_key(line).as_deref() == Some(key.as_str()))
            .map(|(idx, _)| idx)
            .collect();
        sites.sort_by_key(|idx| (idx.abs_diff(expected), *idx));

        for site in sites {
            let end = construct_end(lines, site);
            let scope = match offset_in_hunk {
                Some(k) => Scope {
                    expected: site.saturating_sub(k),
                    lo: site.saturating_sub(k.saturating_add(fuzz)).max(floor),
                    hi: end,
                },
                None => Scope {
                    expected: site + 1,
                    lo: (site + 1).max(floor),
                    hi: end,
                },
            };
            if scope.lo > scope.hi {
                continue;
            }
            if let Some(placement) = fuzzy_fit(lines, hunk, scope, fuzz) {
                return Some(placement);
            }
        }
    }
    None
}

/// Exclusive end of the construct whose signature sits at `start`: the next
/// non-blank line indented no deeper than the signature, closing brackets
/// excepted.
fn construct_end(lines: &[String], start: usize) -> usize {
    let indent = indent_width(&lines[start]);
    for (idx, line) in lines.iter().enumerate().skip(start + 1) {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let closes = trimmed.starts_with('}')
            || trimmed.starts_with(')')
            || trimmed.starts_with(']')
            || trimmed == "end";
        if indent_width(line) <= indent && !closes {
            return idx;
        }
    }
    lines.len()
}

fn indent_width(line: &str) -> usize {
    line.chars()
        .take_while(|c| *c == ' ' || *c == '\t')
        .map(|c| if c == '\t' { 4 } else { 1 })
        .sum()
}

/// `"def name"`-style key for a line that opens a named construct.
pub(crate) fn signature_key(line: &str) -> Option<String> {
    let mut rest = line.trim();
    let keyword = loop {
        let (word, tail) = match rest.split_once(char::is_whitespace) {
            Some((w, t)) => (w, t.trim_start()),
            None => return None,
        };
        if SIGNATURE_MODIFIERS.contains(&word) {
            rest = tail;
            continue;
        }
        if SIGNATURE_KEYWORDS.contains(&word) {
            rest = tail;
            break word;
        }
        return None;
    };

    if keyword == "impl" {
        let head = rest.split('{').next().unwrap_or(rest);
        let head = normalize_ws(head);
        return (!head.is_empty()).then(|| format!("impl {}", head));
    }
    if keyword == "func" && rest.starts_with('(') {
        rest = rest.split_once(')').map(|(_, t)| t.trim_start()).unwrap_or("");
    }
    let name: String = rest
        .chars()
        .take_while(|c| c.is_alphanumeric() || *c == '_' || *c == '$')
        .collect();
    (!name.is_empty()).then(|| format!("{} {}", keyword, name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::HunkLine;

    fn hunk(old_start: usize, body: &[(&str, LineKind)]) -> Hunk {
        let lines: Vec<HunkLine> = body
            .iter()
            .map(|(text, kind)| HunkLine {
                kind: *kind,
                text: format!("{}\n", text),
            })
            .collect();
        let old_count = lines.iter().filter(|l| l.kind != LineKind::Add).count();
        let new_count = lines.iter().filter(|l| l.kind != LineKind::Remove).count();
        Hunk {
            old_start,
            old_count,
            new_start: old_start,
            new_count,
            section: String::new(),
            lines,
        }
    }

    fn file(lines: &[&str]) -> Vec<String> {
        lines.iter().map(|l| format!("{}\n", l)).collect()
    }

    #[test]
    fn signature_keys_cover_common_languages() {
        assert_eq!(signature_key("def main():").as_deref(), Some("def main"));
        assert_eq!(
            signature_key("    async def fetch(self, url):").as_deref(),
            Some("def fetch")
        );
        assert_eq!(
            signature_key("pub(crate) fn build<T>(x: T) {").as_deref(),
            Some("fn build")
        );
        assert_eq!(
            signature_key("impl Display for Key {").as_deref(),
            Some("impl Display for Key")
        );
        assert_eq!(
            signature_key("func (s *Server) Serve(l net.Listener) error {").as_deref(),
            Some("func Serve")
        );
        assert_eq!(
            signature_key("export default function render() {").as_deref(),
            Some("function render")
        );
        assert_eq!(signature_key("x = def_value"), None);
        assert_eq!(signature_key("class"), None);
    }

    #[test]
    fn fuzzy_prefers_exact_whitespace_then_nearest_then_lowest() {
        use LineKind::*;
        let h = hunk(5, &[("a", Context), ("b", Remove), ("B", Add)]);
        // Two exact matches equidistant from the expected index 3.
        let lines = file(&["a", "b", "x", "x", "x", "x", "a", "b"]);
        let placement = fuzzy_fit(&lines, &h, Scope::window(3, 50, 0), 2).expect("fit");
        assert_eq!(placement.index, 0);
        assert!(placement.exact_whitespace);

        let spaced = file(&["a  ", "b", "x", "a", "b"]);
        let placement = fuzzy_fit(&spaced, &h, Scope::window(0, 50, 0), 2).expect("fit");
        assert_eq!(placement.index, 3, "exact whitespace beats distance");
    }

    #[test]
    fn fuzzy_trims_context_before_giving_up() {
        use LineKind::*;
        let h = hunk(
            1,
            &[
                ("stale header", Context),
                ("keep", Context),
                ("old", Remove),
                ("new", Add),
                ("tail", Context),
            ],
        );
        let lines = file(&["renamed header", "keep", "old", "tail"]);
        let placement = fuzzy_fit(&lines, &h, Scope::window(0, 50, 0), 2).expect("fit");
        assert_eq!(placement.trimmed_lead, 1);
        assert_eq!(placement.index, 1);
        assert!(fuzzy_fit(&lines, &h, Scope::window(0, 50, 0), 0).is_none());

        // An unbounded window still trims without overflowing.
        let unbounded = Scope::window(0, usize::MAX, 0);
        assert_eq!(unbounded.hi, usize::MAX);
        let placement = fuzzy_fit(&lines, &h, unbounded, 2).expect("fit");
        assert_eq!(placement.index, 1);
    }

    #[test]
    fn fuzzy_respects_window_and_floor() {
        use LineKind::*;
        let h = hunk(1, &[("target", Remove), ("done", Add)]);
        let mut raw = vec!["pad"; 80];
        raw.push("target");
        let lines = file(&raw);
        assert!(fuzzy_fit(&lines, &h, Scope::window(0, 50, 0), 2).is_none());
        assert_eq!(
            fuzzy_fit(&lines, &h, Scope::window(60, 50, 0), 2).map(|p| p.index),
            Some(80)
        );
        assert!(fuzzy_fit(&lines, &h, Scope::window(60, 50, 81), 2).is_none());
    }

    #[test]
    fn structural_reanchors_on_section_signature() {
        use LineKind::*;
        let mut h = hunk(3, &[("    return 1", Remove), ("    return 2", Add)]);
        h.section = "def target():".to_string();
        let mut raw: Vec<&str> = Vec::new();
        raw.extend(std::iter::repeat("# filler").take(120));
        raw.extend(["def other():", "    return 1", "", "def target():", "    x = 0", "    return 1"]);
        let lines = file(&raw);
        assert!(fuzzy_fit(&lines, &h, Scope::window(2, 50, 0), 2).is_none());
        let placement = structural_fit(&lines, &h, 2, 0, 2).expect("anchored");
        assert_eq!(placement.index, 125);
    }

    #[test]
    fn construct_extent_stops_at_dedent() {
        let lines = file(&["class A:", "    def f(self):", "        pass", "", "def g():", "    pass"]);
        assert_eq!(construct_end(&lines, 0), 4);
        assert_eq!(construct_end(&lines, 1), 4);
        let rust = file(&["fn a() {", "    1", "}", "fn b() {}"]);
        assert_eq!(construct_end(&rust, 0), 3);
    }
}
