//! End-to-end merge scenarios through the file-type handlers.
//!
//! Each test writes ancestor/ours/theirs versions of a project data file to
//! a temporary directory, runs the handler the registry picks for it, and
//! inspects the merged file and the reports, exactly as the sync
//! coordinator's merge hook does.

use std::path::PathBuf;

use tempfile::TempDir;

use treesync_core::handlers::HandlerRegistry;
use treesync_core::merge::{
    ChangeKind, ConflictHandlingMode, ConflictKind, MergeOrder, MergeReports, MergeSituation,
};
use treesync_core::xml::{Document, Element};

// ===========================================================================
// Helpers
// ===========================================================================

const ANCESTOR: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<languageproject version="7000037">
  <rt class="LexEntry" guid="oldie" ownerguid="originalOwner">
    <CitationForm>
      <AUni ws="en">dog</AUni>
      <AUni ws="es">perro</AUni>
    </CitationForm>
    <Comment>
      <AStr ws="en">
        <Run ws="en">a pet</Run>
      </AStr>
    </Comment>
  </rt>
  <rt class="LexSense" guid="sense1" ownerguid="oldie" />
</languageproject>
"#;

struct Workspace {
    _dir: TempDir,
    ours: PathBuf,
    ancestor: PathBuf,
    theirs: PathBuf,
}

fn workspace(file_name: &str, ancestor: &str, ours: &str, theirs: &str) -> Workspace {
    let dir = tempfile::tempdir().unwrap();
    let ext = file_name.rsplit('.').next().unwrap();
    let ws = Workspace {
        ours: dir.path().join(format!("ours.{ext}")),
        ancestor: dir.path().join(format!("ancestor.{ext}")),
        theirs: dir.path().join(format!("theirs.{ext}")),
        _dir: dir,
    };
    std::fs::write(&ws.ours, ours).unwrap();
    std::fs::write(&ws.ancestor, ancestor).unwrap();
    std::fs::write(&ws.theirs, theirs).unwrap();
    ws
}

fn merge_with_mode(
    file_name: &str,
    ancestor: &str,
    ours: &str,
    theirs: &str,
    mode: ConflictHandlingMode,
) -> (String, MergeReports) {
    let ws = workspace(file_name, ancestor, ours, theirs);
    let registry = HandlerRegistry::with_builtin_handlers();
    let handler = registry.handler_for(file_name);
    let situation = MergeSituation::new("alice", "aaaa", "bob", "bbbb", mode);
    let mut reports = MergeReports::new();
    {
        let mut order =
            MergeOrder::new(&ws.ours, &ws.ancestor, &ws.theirs, situation, &mut reports);
        handler.do_three_way_merge(&mut order).unwrap();
    }
    (std::fs::read_to_string(&ws.ours).unwrap(), reports)
}

fn merge(ancestor: &str, ours: &str, theirs: &str) -> (String, MergeReports) {
    merge_with_mode(
        "Project.fwdata",
        ancestor,
        ours,
        theirs,
        ConflictHandlingMode::OursWins,
    )
}

fn rt<'d>(doc: &'d Document, guid: &str) -> Option<&'d Element> {
    doc.root.find_by_attribute("guid", guid)
}

fn alternative<'d>(entry: &'d Element, ws: &str) -> &'d str {
    entry
        .child("CitationForm")
        .and_then(|form| form.find_by_attribute("ws", ws))
        .and_then(|alt| alt.text.as_deref())
        .unwrap()
}

// ===========================================================================
// Scenarios
// ===========================================================================

#[test]
fn test_merging_identical_versions_changes_nothing() {
    let (merged, reports) = merge(ANCESTOR, ANCESTOR, ANCESTOR);
    assert_eq!(merged, ANCESTOR);
    assert!(reports.is_empty());

    let doc = Document::parse(ANCESTOR).unwrap();
    assert_eq!(doc.to_xml_string(), ANCESTOR);
}

#[test]
fn test_clean_deletion_by_one_side() {
    let theirs = ANCESTOR.replace(
        "  <rt class=\"LexSense\" guid=\"sense1\" ownerguid=\"oldie\" />\n",
        "",
    );
    let ours = ANCESTOR.replace("version=\"7000037\"", "version=\"7000038\"");
    let (merged, reports) = merge(ANCESTOR, &ours, &theirs);

    let doc = Document::parse(&merged).unwrap();
    assert!(rt(&doc, "sense1").is_none());
    assert_eq!(doc.root.attribute("version"), Some("7000038"));
    assert_eq!(reports.changes.len(), 1);
    assert_eq!(reports.changes[0].kind, ChangeKind::Deletion);
    assert!(reports.conflicts.is_empty());
}

#[test]
fn test_disjoint_additions_never_conflict() {
    let ours = ANCESTOR.replace(
        "</languageproject>",
        "  <rt class=\"LexEntry\" guid=\"newbieOurs\" />\n</languageproject>",
    );
    let theirs = ANCESTOR.replace(
        "</languageproject>",
        "  <rt class=\"LexEntry\" guid=\"newbieTheirs\" />\n</languageproject>",
    );
    let (merged, reports) = merge(ANCESTOR, &ours, &theirs);

    let doc = Document::parse(&merged).unwrap();
    for guid in ["oldie", "sense1", "newbieOurs", "newbieTheirs"] {
        assert!(rt(&doc, guid).is_some(), "missing {guid}");
    }
    assert_eq!(reports.changes.len(), 2);
    assert!(reports
        .changes
        .iter()
        .all(|c| c.kind == ChangeKind::Addition));
    assert!(reports.conflicts.is_empty());
}

#[test]
fn test_edit_versus_delete_keeps_the_edit() {
    let ours = ANCESTOR.replace("originalOwner", "editedOwner");
    let start = ANCESTOR.find("  <rt class=\"LexEntry\"").unwrap();
    let end = ANCESTOR.find("  <rt class=\"LexSense\"").unwrap();
    let theirs = format!("{}{}", &ANCESTOR[..start], &ANCESTOR[end..]);
    let (merged, reports) = merge(ANCESTOR, &ours, &theirs);

    let doc = Document::parse(&merged).unwrap();
    let entry = rt(&doc, "oldie").expect("edited element survives");
    assert_eq!(entry.attribute("ownerguid"), Some("editedOwner"));
    assert_eq!(reports.conflicts.len(), 1);
    assert_eq!(
        reports.conflicts[0].kind,
        ConflictKind::EditedVsRemovedElement
    );
    assert_eq!(reports.conflicts[0].winner_id, "alice");
}

#[test]
fn test_convergent_attribute_edit() {
    let both = ANCESTOR.replace("originalOwner", "sameNewOwner");
    let (merged, reports) = merge(ANCESTOR, &both, &both);
    // Byte-identical sides still run through the tree merge and agree.
    let doc = Document::parse(&merged).unwrap();
    assert_eq!(
        rt(&doc, "oldie").unwrap().attribute("ownerguid"),
        Some("sameNewOwner")
    );
    assert!(reports.conflicts.is_empty());
    assert_eq!(reports.changes.len(), 1);
    assert_eq!(reports.changes[0].kind, ChangeKind::Edit);
}

#[test]
fn test_divergent_attribute_edit_ours_wins_by_default() {
    let ours = ANCESTOR.replace("originalOwner", "newWinningOwner");
    let theirs = ANCESTOR.replace("originalOwner", "newLosingOwner");
    let (merged, reports) = merge(ANCESTOR, &ours, &theirs);

    let doc = Document::parse(&merged).unwrap();
    assert_eq!(
        rt(&doc, "oldie").unwrap().attribute("ownerguid"),
        Some("newWinningOwner")
    );
    assert_eq!(reports.conflicts.len(), 1);
    let conflict = &reports.conflicts[0];
    assert_eq!(conflict.kind, ConflictKind::BothEditedAttribute);
    assert_eq!(conflict.winning_value, "newWinningOwner");
    assert_eq!(conflict.losing_value, "newLosingOwner");
    assert_eq!(conflict.loser_id, "bob");
    assert_eq!(conflict.loser_revision, "bbbb");
    assert!(conflict.path.ends_with("@ownerguid"));
}

#[test]
fn test_divergent_attribute_edit_theirs_wins_when_configured() {
    let ours = ANCESTOR.replace("originalOwner", "oursOwner");
    let theirs = ANCESTOR.replace("originalOwner", "theirsOwner");
    let (merged, reports) = merge_with_mode(
        "Project.fwdata",
        ANCESTOR,
        &ours,
        &theirs,
        ConflictHandlingMode::TheirsWins,
    );
    let doc = Document::parse(&merged).unwrap();
    assert_eq!(
        rt(&doc, "oldie").unwrap().attribute("ownerguid"),
        Some("theirsOwner")
    );
    assert_eq!(reports.conflicts[0].winner_id, "bob");
    assert_eq!(reports.conflicts[0].losing_value, "oursOwner");
}

#[test]
fn test_alternatives_merge_independently() {
    let ours = ANCESTOR.replace(">dog<", ">hound<");
    let theirs = ANCESTOR.replace(">perro<", ">can<");
    let (merged, reports) = merge(ANCESTOR, &ours, &theirs);

    let doc = Document::parse(&merged).unwrap();
    let entry = rt(&doc, "oldie").unwrap();
    assert_eq!(alternative(entry, "en"), "hound");
    assert_eq!(alternative(entry, "es"), "can");
    assert!(reports.conflicts.is_empty());
}

#[test]
fn test_one_alternative_conflicts_while_its_sibling_merges() {
    let ours = ANCESTOR
        .replace(">dog<", ">hound<")
        .replace(">perro<", ">perrito<");
    let theirs = ANCESTOR.replace(">dog<", ">canine<");
    let (merged, reports) = merge(ANCESTOR, &ours, &theirs);

    let doc = Document::parse(&merged).unwrap();
    let entry = rt(&doc, "oldie").unwrap();
    assert_eq!(alternative(entry, "en"), "hound");
    assert_eq!(alternative(entry, "es"), "perrito");
    assert_eq!(reports.conflicts.len(), 1);
    assert_eq!(reports.conflicts[0].kind, ConflictKind::BothEditedText);
    assert_eq!(reports.conflicts[0].losing_value, "canine");
}

#[test]
fn test_formatted_string_edited_in_different_runs_conflicts_as_a_whole() {
    let ancestor = ANCESTOR.replace(
        r#"<Run ws="en">a pet</Run>"#,
        r#"<Run ws="en">variant </Run><Run ws="es">variante</Run>"#,
    );
    let ours = ancestor.replace(">variant <", ">variantNew <");
    let theirs = ancestor.replace(">variante<", ">varianteNew<");
    let (merged, reports) = merge(&ancestor, &ours, &theirs);

    let doc = Document::parse(&merged).unwrap();
    let runs: Vec<&str> = rt(&doc, "oldie")
        .and_then(|entry| entry.child("Comment"))
        .and_then(|comment| comment.child("AStr"))
        .unwrap()
        .children
        .iter()
        .filter_map(|run| run.text.as_deref())
        .collect();
    assert_eq!(runs, vec!["variantNew ", "variante"]);
    assert_eq!(reports.conflicts.len(), 1);
    assert_eq!(reports.conflicts[0].kind, ConflictKind::BothEditedElement);
}

fn with_sense_body(body: &str) -> String {
    ANCESTOR.replace(
        r#"<rt class="LexSense" guid="sense1" ownerguid="oldie" />"#,
        &format!(r#"<rt class="LexSense" guid="sense1" ownerguid="oldie">{body}</rt>"#),
    )
}

fn sense_references(merged: &str, property: &str) -> Vec<String> {
    let doc = Document::parse(merged).unwrap();
    rt(&doc, "sense1")
        .and_then(|sense| sense.child(property))
        .unwrap()
        .children
        .iter()
        .filter_map(|objsur| objsur.attribute("guid").map(str::to_string))
        .collect()
}

#[test]
fn test_both_edited_atomic_reference_conflicts() {
    let ancestor = with_sense_body(r#"<Type><objsur t="r" guid="original" /></Type>"#);
    let ours = with_sense_body(r#"<Type><objsur t="r" guid="ourNew" /></Type>"#);
    let theirs = with_sense_body(r#"<Type><objsur t="r" guid="theirNew" /></Type>"#);
    let (merged, reports) = merge(&ancestor, &ours, &theirs);

    assert_eq!(sense_references(&merged, "Type"), vec!["ourNew"]);
    assert_eq!(reports.conflicts.len(), 1);
    assert_eq!(reports.conflicts[0].kind, ConflictKind::BothEditedElement);
}

#[test]
fn test_both_edited_reference_sequence_keeps_one_side_whole() {
    let ancestor = with_sense_body(
        r#"<Analyses><objsur t="r" guid="original1" /><objsur t="r" guid="original2" /></Analyses>"#,
    );
    let ours = with_sense_body(
        r#"<Analyses><objsur t="r" guid="ourNew1" /><objsur t="r" guid="ourNew2" /></Analyses>"#,
    );
    let theirs = with_sense_body(r#"<Analyses><objsur t="r" guid="theirNew1" /></Analyses>"#);
    let (merged, reports) = merge(&ancestor, &ours, &theirs);

    assert_eq!(sense_references(&merged, "Analyses"), vec!["ourNew1", "ourNew2"]);
    assert_eq!(reports.conflicts.len(), 1);
    assert!(reports.changes.is_empty());
}

#[test]
fn test_file_added_on_both_sides_merges_against_empty_root() {
    let ours = "<languageproject>\n  <rt class=\"LexEntry\" guid=\"a\" />\n</languageproject>\n";
    let theirs = "<languageproject>\n  <rt class=\"LexEntry\" guid=\"b\" />\n</languageproject>\n";
    let (merged, reports) = merge("", ours, theirs);

    let doc = Document::parse(&merged).unwrap();
    assert_eq!(doc.root.children.len(), 2);
    assert_eq!(reports.changes.len(), 2);
    assert!(reports.conflicts.is_empty());
}

#[test]
fn test_unclaimed_files_use_the_line_merge() {
    let ancestor = "alpha\nbeta\ngamma\ndelta\nepsilon\n";
    let ours = "ALPHA\nbeta\ngamma\ndelta\nepsilon\n";
    let theirs = "alpha\nbeta\ngamma\ndelta\nEPSILON\n";
    let (merged, reports) = merge_with_mode(
        "notes.txt",
        ancestor,
        ours,
        theirs,
        ConflictHandlingMode::OursWins,
    );
    assert_eq!(merged, "ALPHA\nbeta\ngamma\ndelta\nEPSILON\n");
    assert!(reports.is_empty());

    let (merged, reports) = merge_with_mode(
        "notes.txt",
        "line\n",
        "ours\n",
        "theirs\n",
        ConflictHandlingMode::OursWins,
    );
    assert_eq!(merged, "ours\n");
    assert_eq!(reports.conflicts.len(), 1);
    assert_eq!(reports.conflicts[0].kind, ConflictKind::BothEditedFile);
}

#[test]
fn test_reports_serialize_with_stable_tags() {
    let ours = ANCESTOR.replace("originalOwner", "newWinningOwner");
    let theirs = ANCESTOR
        .replace("originalOwner", "newLosingOwner")
        .replace(
            "</languageproject>",
            "  <rt class=\"LexEntry\" guid=\"extra\" />\n</languageproject>",
        );
    let (_, reports) = merge(ANCESTOR, &ours, &theirs);

    let json = reports.to_json().unwrap();
    assert!(json.contains("\"both_edited_attribute\""));
    assert!(json.contains("\"addition\""));
    let round: MergeReports = serde_json::from_str(&json).unwrap();
    assert_eq!(round, reports);
}
