//! Merge Engine (spec §4.5): three-way body merge via diff3, frontmatter
//! merge via the per-field policy table, and a consent-gated two-way
//! fallback for hosts with no common ancestor snapshot.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::frontmatter::{merge_frontmatter, FrontmatterError, Note, KEY_CONFLICTS, KEY_NEEDS_REVIEW};
use crate::model::Annotation;

#[derive(Debug, Error)]
pub enum MergeError {
    #[error(transparent)]
    Frontmatter(#[from] FrontmatterError),
}

#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub content: String,
    /// At least one body region required a conflict callout.
    pub conflicts: bool,
}

const CONFLICT_START: &str = "<<<<<<< vault";
const CONFLICT_MID: &str = "=======";
const CONFLICT_END: &str = ">>>>>>> device";
const CONFLICT_NOTICE: &str = "> ⚠️ Merge conflict: this note has unresolved changes from both the vault and the device. Review the `<<<<<<< vault` / `>>>>>>> device` blocks below.";

/// Three-way merge of a note: body via diff3, frontmatter via the per-field
/// policy table (spec §4.5 step 4). `base` is the last snapshot (common
/// ancestor); `ours` is the current vault content; `theirs` is the freshly
/// re-rendered content from the source device.
pub fn three_way_merge(
    base: &str,
    ours: &str,
    theirs: &str,
    disabled_fields: &[String],
) -> Result<MergeOutcome, MergeError> {
    let base_note = Note::parse(base)?;
    let mut ours_note = Note::parse(ours)?;
    let theirs_note = Note::parse(theirs)?;

    let (merged_body, conflicts) = diff3_merge_text(&base_note.body, &ours_note.body, &theirs_note.body);

    merge_frontmatter(&mut ours_note.frontmatter, &theirs_note.frontmatter, disabled_fields);
    if conflicts {
        ours_note.frontmatter.insert(
            KEY_CONFLICTS.to_string(),
            serde_yaml::Value::String("unresolved".to_string()),
        );
        ours_note.frontmatter.insert(
            KEY_NEEDS_REVIEW.to_string(),
            serde_yaml::Value::Bool(true),
        );
    }
    ours_note.body = if conflicts {
        format!("{CONFLICT_NOTICE}\n\n{merged_body}")
    } else {
        merged_body
    };

    Ok(MergeOutcome {
        content: ours_note.render()?,
        conflicts,
    })
}

/// Line-based diff3 merge. Synchronizes on base lines left unchanged by
/// *both* sides (an anchor), then resolves each gap between anchors:
/// unchanged-by-one-side wins, identical edits collapse, and genuine
/// divergence becomes a conflict block.
fn diff3_merge_text(base: &str, ours: &str, theirs: &str) -> (String, bool) {
    let base_lines: Vec<&str> = split_lines(base);
    let ours_lines: Vec<&str> = split_lines(ours);
    let theirs_lines: Vec<&str> = split_lines(theirs);

    let ours_map = equal_map(&base_lines, &ours_lines);
    let theirs_map = equal_map(&base_lines, &theirs_lines);

    // Anchors: base indices unchanged in both sides, plus virtual
    // start/end anchors at (-1, -1, -1) and (len, ours.len(), theirs.len()).
    // All three coordinates use the same "-1 means nothing consumed yet"
    // convention so that `prev + 1` is always the start of the next gap.
    let mut anchors: Vec<(i64, i64, i64)> = vec![(-1, -1, -1)];
    for i in 0..base_lines.len() {
        if let (Some(o), Some(t)) = (ours_map[i], theirs_map[i]) {
            anchors.push((i as i64, o as i64, t as i64));
        }
    }
    anchors.push((
        base_lines.len() as i64,
        ours_lines.len() as i64,
        theirs_lines.len() as i64,
    ));

    let mut out = String::new();
    let mut conflicts = false;

    for pair in anchors.windows(2) {
        let (prev_base, prev_ours, prev_theirs) = pair[0];
        let (cur_base, cur_ours, cur_theirs) = pair[1];

        let base_seg = &base_lines[(prev_base + 1) as usize..cur_base as usize];
        let ours_seg = &ours_lines[(prev_ours + 1) as usize..cur_ours as usize];
        let theirs_seg = &theirs_lines[(prev_theirs + 1) as usize..cur_theirs as usize];

        append_segment(&mut out, base_seg, ours_seg, theirs_seg, &mut conflicts);

        if cur_base >= 0 && (cur_base as usize) < base_lines.len() {
            out.push_str(base_lines[cur_base as usize]);
            out.push('\n');
        }
    }

    // Collapse the trailing newline introduced by always terminating lines
    // with '\n' above, matching the source's own trailing-newline presence.
    if !ours.ends_with('\n') && !theirs.ends_with('\n') && out.ends_with('\n') {
        out.pop();
    }

    (out, conflicts)
}

fn append_segment(
    out: &mut String,
    base_seg: &[&str],
    ours_seg: &[&str],
    theirs_seg: &[&str],
    conflicts: &mut bool,
) {
    let ours_unchanged = ours_seg == base_seg;
    let theirs_unchanged = theirs_seg == base_seg;

    if ours_unchanged && theirs_unchanged {
        for line in base_seg {
            out.push_str(line);
            out.push('\n');
        }
    } else if ours_unchanged {
        for line in theirs_seg {
            out.push_str(line);
            out.push('\n');
        }
    } else if theirs_unchanged {
        for line in ours_seg {
            out.push_str(line);
            out.push('\n');
        }
    } else if ours_seg == theirs_seg {
        for line in ours_seg {
            out.push_str(line);
            out.push('\n');
        }
    } else {
        *conflicts = true;
        out.push_str(CONFLICT_START);
        out.push('\n');
        for line in ours_seg {
            out.push_str(line);
            out.push('\n');
        }
        out.push_str(CONFLICT_MID);
        out.push('\n');
        for line in theirs_seg {
            out.push_str(line);
            out.push('\n');
        }
        out.push_str(CONFLICT_END);
        out.push('\n');
    }
}

fn split_lines(text: &str) -> Vec<&str> {
    if text.is_empty() {
        Vec::new()
    } else {
        text.split('\n').collect()
    }
}

/// `map[i] == Some(j)` when base line `i` survives unchanged as line `j` of
/// `other` (i.e. falls inside an Equal op of the base→other diff).
fn equal_map(base_lines: &[&str], other_lines: &[&str]) -> Vec<Option<usize>> {
    use similar::{capture_diff_slices, Algorithm};
    let mut map = vec![None; base_lines.len()];
    let ops = capture_diff_slices(Algorithm::Myers, base_lines, other_lines);
    for op in ops {
        if let similar::DiffOp::Equal {
            old_index,
            new_index,
            len,
        } = op
        {
            for k in 0..len {
                map[old_index + k] = Some(new_index + k);
            }
        }
    }
    map
}

/// Consent-gated fallback when there is no common-ancestor snapshot to
/// diff3 against (spec §9 open question: "per-occurrence consent"). Unions
/// annotations by id; on an id collision, the vault's own copy wins since
/// it may carry a user edit the device copy doesn't know about.
pub fn two_way_union_merge_by_id(
    ours: &[Annotation],
    theirs: &[Annotation],
    consent_given: bool,
) -> Option<Vec<Annotation>> {
    if !consent_given {
        return None;
    }
    let mut by_id: BTreeMap<String, Annotation> = BTreeMap::new();
    for a in theirs {
        by_id.insert(a.id.clone(), a.clone());
    }
    for a in ours {
        by_id.insert(a.id.clone(), a.clone());
    }
    Some(by_id.into_values().collect())
}

/// True if `content` is stamped with an unresolved conflict marker from a
/// prior merge (used by the Planner to decide whether a note needs human
/// attention before it can be auto-merged again).
pub fn has_unresolved_conflicts(content: &str) -> bool {
    content.contains(CONFLICT_START)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_inputs_produce_no_conflict() {
        let text = "line one\nline two\nline three";
        let (merged, conflicts) = diff3_merge_text(text, text, text);
        assert!(!conflicts);
        assert_eq!(merged, text);
    }

    #[test]
    fn only_theirs_changed_takes_theirs() {
        let base = "a\nb\nc";
        let ours = "a\nb\nc";
        let theirs = "a\nb2\nc";
        let (merged, conflicts) = diff3_merge_text(base, ours, theirs);
        assert!(!conflicts);
        assert_eq!(merged, "a\nb2\nc");
    }

    #[test]
    fn only_ours_changed_takes_ours() {
        let base = "a\nb\nc";
        let ours = "a\nb-edited\nc";
        let theirs = "a\nb\nc";
        let (merged, conflicts) = diff3_merge_text(base, ours, theirs);
        assert!(!conflicts);
        assert_eq!(merged, "a\nb-edited\nc");
    }

    #[test]
    fn both_sides_append_disjoint_lines_no_conflict() {
        let base = "a\nb";
        let ours = "a\nb\nours-note";
        let theirs = "a\nb\ntheirs-note";
        let (merged, conflicts) = diff3_merge_text(base, ours, theirs);
        // Both sides appended after the last anchor: genuinely divergent
        // edits to the same trailing region, so this is a real conflict.
        assert!(conflicts);
        assert!(merged.contains("ours-note"));
        assert!(merged.contains("theirs-note"));
    }

    #[test]
    fn same_edit_on_both_sides_collapses() {
        let base = "a\nb\nc";
        let ours = "a\nB\nc";
        let theirs = "a\nB\nc";
        let (merged, conflicts) = diff3_merge_text(base, ours, theirs);
        assert!(!conflicts);
        assert_eq!(merged, "a\nB\nc");
    }

    #[test]
    fn divergent_edit_produces_conflict_markers() {
        let base = "a\nb\nc";
        let ours = "a\nb-ours\nc";
        let theirs = "a\nb-theirs\nc";
        let (merged, conflicts) = diff3_merge_text(base, ours, theirs);
        assert!(conflicts);
        assert!(merged.contains(CONFLICT_START));
        assert!(merged.contains("b-ours"));
        assert!(merged.contains("b-theirs"));
    }

    #[test]
    fn three_way_merge_stamps_conflicts_field() {
        let base = "---\ntitle: X\n---\nbase body";
        let ours = "---\ntitle: X\n---\nours body";
        let theirs = "---\ntitle: X\n---\ntheirs body";
        let outcome = three_way_merge(base, ours, theirs, &[]).unwrap();
        assert!(outcome.conflicts);
        assert!(outcome.content.contains("conflicts: unresolved"));
    }

    #[test]
    fn two_way_union_merge_requires_consent() {
        let ours = vec![];
        let theirs = vec![];
        assert!(two_way_union_merge_by_id(&ours, &theirs, false).is_none());
        assert!(two_way_union_merge_by_id(&ours, &theirs, true).is_some());
    }

    #[test]
    fn two_way_union_merge_prefers_ours_on_id_collision() {
        let ours_annotation = Annotation {
            id: "shared".into(),
            page: 1,
            pos0: "p0".into(),
            pos1: "p1".into(),
            datetime: "t".into(),
            text: "ours version".into(),
            note: None,
            chapter: None,
            color: None,
            drawer: None,
        };
        let mut theirs_annotation = ours_annotation.clone();
        theirs_annotation.text = "theirs version".into();

        let merged =
            two_way_union_merge_by_id(&[ours_annotation], &[theirs_annotation], true).unwrap();
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].text, "ours version");
    }
}
