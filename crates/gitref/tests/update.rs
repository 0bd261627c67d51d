//! Write-side behavior: updates, deletes, links, renames, packing, and the
//! change-event protocol.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bstr::BString;
use gitref::{RefDatabase, Storage, UpdateResult};
use gitref_hash::ObjectId;
use gitref_utils::date::{GitDate, Signature};

const A: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
const B: &str = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";
const C: &str = "cccccccccccccccccccccccccccccccccccccccc";

fn oid(hex: &str) -> ObjectId {
    ObjectId::from_hex(hex).unwrap()
}

fn make_db(git_dir: &Path) -> RefDatabase {
    let mut db = RefDatabase::new(git_dir);
    db.set_committer(Signature {
        name: BString::from("Test User"),
        email: BString::from("test@example.com"),
        date: GitDate::new(1234567890, 0),
    });
    db.create().unwrap();
    db
}

fn create_branch(db: &RefDatabase, name: &str, hex: &str) {
    let mut update = db.new_update(name, false).unwrap();
    update.set_new_id(oid(hex));
    update.set_reflog_message(format!("branch: created {name}"));
    assert_eq!(update.update().unwrap(), UpdateResult::New);
}

#[test]
fn update_writes_reflog() {
    let dir = tempfile::tempdir().unwrap();
    let db = make_db(dir.path());
    create_branch(&db, "refs/heads/main", A);

    let entries = db.reflog().read("refs/heads/main").unwrap();
    assert_eq!(entries.len(), 1);
    assert!(entries[0].old_id.is_zero());
    assert_eq!(entries[0].new_id, oid(A));
}

#[test]
fn guarded_update_succeeds_then_stale_guard_fails() {
    let dir = tempfile::tempdir().unwrap();
    let db = make_db(dir.path());
    create_branch(&db, "refs/heads/main", A);

    let mut update = db.new_update("refs/heads/main", false).unwrap();
    update.set_expected_old_id(Some(oid(A)));
    update.set_new_id(oid(B));
    assert_eq!(update.update().unwrap(), UpdateResult::Forced);

    // The guard now names a value no longer on disk.
    let mut stale = db.new_update("refs/heads/main", false).unwrap();
    stale.set_expected_old_id(Some(oid(A)));
    stale.set_new_id(oid(C));
    assert_eq!(stale.update().unwrap(), UpdateResult::LockFailure);

    assert_eq!(
        db.get_ref("refs/heads/main").unwrap().unwrap().object_id(),
        Some(oid(B))
    );
}

#[test]
fn unguarded_unforced_overwrite_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let db = make_db(dir.path());
    create_branch(&db, "refs/heads/main", A);

    let mut update = db.new_update("refs/heads/main", false).unwrap();
    update.set_new_id(oid(B));
    assert_eq!(update.update().unwrap(), UpdateResult::Rejected);

    update.set_force(true);
    assert_eq!(update.update().unwrap(), UpdateResult::Forced);
}

#[test]
fn rewriting_same_value_is_no_change() {
    let dir = tempfile::tempdir().unwrap();
    let db = make_db(dir.path());
    create_branch(&db, "refs/heads/main", A);

    let mut update = db.new_update("refs/heads/main", false).unwrap();
    update.set_new_id(oid(A));
    assert_eq!(update.update().unwrap(), UpdateResult::NoChange);
}

#[test]
fn update_through_symbolic_head_writes_leaf_and_both_logs() {
    let dir = tempfile::tempdir().unwrap();
    let db = make_db(dir.path());
    create_branch(&db, "refs/heads/main", A);

    let mut head = db.new_update("HEAD", false).unwrap();
    head.link("refs/heads/main").unwrap();

    let mut update = db.new_update("HEAD", false).unwrap();
    assert_eq!(update.destination().as_str(), "refs/heads/main");
    update.set_new_id(oid(B));
    update.set_force(true);
    update.set_reflog_message("commit: through HEAD");
    assert_eq!(update.update().unwrap(), UpdateResult::Forced);

    // The branch file changed; HEAD is still symbolic.
    assert_eq!(
        fs::read_to_string(dir.path().join("refs/heads/main")).unwrap(),
        format!("{B}\n")
    );
    assert_eq!(
        fs::read_to_string(dir.path().join("HEAD")).unwrap(),
        "ref: refs/heads/main\n"
    );

    // Both the symbolic name and the leaf got a log entry.
    assert_eq!(db.reflog().read("HEAD").unwrap()[0].new_id, oid(B));
    assert_eq!(
        db.reflog().read("refs/heads/main").unwrap()[0].new_id,
        oid(B)
    );
}

#[test]
fn detached_update_replaces_head_itself() {
    let dir = tempfile::tempdir().unwrap();
    let db = make_db(dir.path());
    create_branch(&db, "refs/heads/main", A);
    db.new_update("HEAD", false)
        .unwrap()
        .link("refs/heads/main")
        .unwrap();

    let mut detach = db.new_update("HEAD", true).unwrap();
    assert_eq!(detach.destination().as_str(), "HEAD");
    detach.set_new_id(oid(B));
    detach.set_force(true);
    detach.update().unwrap();

    // HEAD is now a direct ref; the branch is untouched.
    assert_eq!(
        fs::read_to_string(dir.path().join("HEAD")).unwrap(),
        format!("{B}\n")
    );
    let head = db.get_ref("HEAD").unwrap().unwrap();
    assert!(!head.is_symbolic());
    assert_eq!(head.object_id(), Some(oid(B)));
    assert_eq!(
        db.get_ref("refs/heads/main").unwrap().unwrap().object_id(),
        Some(oid(A))
    );
}

#[test]
fn delete_loose_ref_prunes_directories_and_log() {
    let dir = tempfile::tempdir().unwrap();
    let db = make_db(dir.path());
    create_branch(&db, "refs/heads/feature/deep/x", A);
    assert!(dir.path().join("refs/heads/feature/deep/x").is_file());

    let mut delete = db.new_update("refs/heads/feature/deep/x", false).unwrap();
    assert_eq!(delete.delete().unwrap(), UpdateResult::Deleted);

    assert!(db.get_ref("refs/heads/feature/deep/x").unwrap().is_none());
    assert!(!dir.path().join("refs/heads/feature").exists());
    assert!(dir.path().join("refs/heads").exists());
    assert!(!dir.path().join("logs/refs/heads/feature").exists());
}

#[test]
fn delete_packed_only_ref_fires_one_event() {
    let dir = tempfile::tempdir().unwrap();
    let db = make_db(dir.path());
    fs::write(
        dir.path().join("packed-refs"),
        format!("# pack-refs with: peeled\n{B} refs/heads/x\n"),
    )
    .unwrap();

    // Absorb the initial population (its 0 → n event is suppressed).
    assert!(db.get_ref("refs/heads/x").unwrap().is_some());

    let events = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&events);
    db.add_refs_changed_listener(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let mut delete = db.new_update("refs/heads/x", false).unwrap();
    assert_eq!(delete.delete().unwrap(), UpdateResult::Deleted);

    assert!(db.get_ref("refs/heads/x").unwrap().is_none());
    assert_eq!(events.load(Ordering::SeqCst), 1);

    let packed = fs::read_to_string(dir.path().join("packed-refs")).unwrap();
    assert!(!packed.contains("refs/heads/x"));
}

#[test]
fn delete_ref_present_both_loose_and_packed() {
    let dir = tempfile::tempdir().unwrap();
    let db = make_db(dir.path());
    fs::write(
        dir.path().join("packed-refs"),
        format!("# pack-refs with: peeled\n{B} refs/heads/main\n"),
    )
    .unwrap();
    create_branch(&db, "refs/heads/other", C);
    fs::write(
        dir.path().join("refs/heads/main"),
        format!("{A}\n"),
    )
    .unwrap();

    let mut delete = db.new_update("refs/heads/main", false).unwrap();
    assert_eq!(delete.delete().unwrap(), UpdateResult::Deleted);

    // Neither storage still has it; other refs untouched.
    assert!(db.get_ref("refs/heads/main").unwrap().is_none());
    assert!(!dir.path().join("refs/heads/main").exists());
    assert!(db.get_ref("refs/heads/other").unwrap().is_some());
}

#[test]
fn deleting_current_branch_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let db = make_db(dir.path());
    create_branch(&db, "refs/heads/main", A);
    db.new_update("HEAD", false)
        .unwrap()
        .link("refs/heads/main")
        .unwrap();

    let mut delete = db.new_update("refs/heads/main", false).unwrap();
    assert_eq!(
        delete.delete().unwrap(),
        UpdateResult::RejectedCurrentBranch
    );
    assert!(db.get_ref("refs/heads/main").unwrap().is_some());
}

#[test]
fn rename_moves_value_and_reflog() {
    let dir = tempfile::tempdir().unwrap();
    let db = make_db(dir.path());
    create_branch(&db, "refs/heads/old", A);

    let mut rename = db.new_rename("refs/heads/old", "refs/heads/new").unwrap();
    assert_eq!(rename.rename().unwrap(), UpdateResult::Renamed);

    assert!(db.get_ref("refs/heads/old").unwrap().is_none());
    assert_eq!(
        db.get_ref("refs/heads/new").unwrap().unwrap().object_id(),
        Some(oid(A))
    );

    // Old history carried over, rename entry appended on top.
    let log = db.reflog().read("refs/heads/new").unwrap();
    assert_eq!(log.len(), 2);
    assert!(log[0]
        .message
        .to_string()
        .contains("renamed refs/heads/old to refs/heads/new"));
    assert_eq!(log[1].new_id, oid(A));
}

#[test]
fn rename_retargets_head() {
    let dir = tempfile::tempdir().unwrap();
    let db = make_db(dir.path());
    create_branch(&db, "refs/heads/old", A);
    db.new_update("HEAD", false)
        .unwrap()
        .link("refs/heads/old")
        .unwrap();

    let mut rename = db.new_rename("refs/heads/old", "refs/heads/new").unwrap();
    assert_eq!(rename.rename().unwrap(), UpdateResult::Renamed);

    let head = db.get_ref("HEAD").unwrap().unwrap();
    assert!(head.is_symbolic());
    assert_eq!(head.leaf().name().as_str(), "refs/heads/new");
    assert_eq!(head.object_id(), Some(oid(A)));
}

#[test]
fn rename_onto_conflicting_name_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let db = make_db(dir.path());
    create_branch(&db, "refs/heads/old", A);
    create_branch(&db, "refs/heads/taken/sub", B);

    let mut rename = db.new_rename("refs/heads/old", "refs/heads/taken").unwrap();
    assert_eq!(rename.rename().unwrap(), UpdateResult::Rejected);
    // Nothing moved.
    assert_eq!(
        db.get_ref("refs/heads/old").unwrap().unwrap().object_id(),
        Some(oid(A))
    );
}

#[test]
fn rename_of_missing_source_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let db = make_db(dir.path());
    let mut rename = db.new_rename("refs/heads/ghost", "refs/heads/new").unwrap();
    assert_eq!(rename.rename().unwrap(), UpdateResult::Rejected);
}

struct NoTags;

impl gitref::ObjectPeeler for NoTags {
    fn tag_target(&self, _id: &ObjectId) -> Result<Option<ObjectId>, gitref::RefError> {
        Ok(None)
    }
}

#[test]
fn pack_refs_moves_loose_into_packed() {
    let dir = tempfile::tempdir().unwrap();
    let db = make_db(dir.path());
    create_branch(&db, "refs/heads/main", A);
    create_branch(&db, "refs/heads/keep", B);

    db.pack_refs(&NoTags, &["refs/heads/main"]).unwrap();

    assert!(!dir.path().join("refs/heads/main").exists());
    let r = db.get_ref("refs/heads/main").unwrap().unwrap();
    assert_eq!(r.object_id(), Some(oid(A)));
    assert_eq!(r.storage(), Storage::Packed);

    // The untouched ref is still loose.
    assert_eq!(
        db.get_ref("refs/heads/keep").unwrap().unwrap().storage(),
        Storage::Loose
    );
    let packed = fs::read_to_string(dir.path().join("packed-refs")).unwrap();
    assert!(packed.contains("refs/heads/main"));
    assert!(!packed.contains("refs/heads/keep"));
}

#[test]
fn link_creates_symbolic_ref() {
    let dir = tempfile::tempdir().unwrap();
    let db = make_db(dir.path());
    create_branch(&db, "refs/heads/main", A);

    let mut head = db.new_update("HEAD", false).unwrap();
    assert_eq!(head.link("refs/heads/main").unwrap(), UpdateResult::New);
    assert_eq!(
        fs::read_to_string(dir.path().join("HEAD")).unwrap(),
        "ref: refs/heads/main\n"
    );

    let resolved = db.get_ref("HEAD").unwrap().unwrap();
    assert!(resolved.is_symbolic());
    assert_eq!(resolved.object_id(), Some(oid(A)));
}

#[test]
fn internal_and_external_changes_advance_mod_count() {
    let dir = tempfile::tempdir().unwrap();
    let db = make_db(dir.path());
    create_branch(&db, "refs/heads/main", A);
    let after_create = db.modification_count();
    assert!(after_create > 0);

    // External rewrite of the loose file.
    fs::write(dir.path().join("refs/heads/main"), format!("{B}\n")).unwrap();
    assert_eq!(
        db.get_ref("refs/heads/main").unwrap().unwrap().object_id(),
        Some(oid(B))
    );
    assert!(db.modification_count() > after_create);
}
