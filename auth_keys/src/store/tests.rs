use super::*;
use crate::error::FieldError;
use crate::record::FlagValue;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tempfile::TempDir;

fn key(i: usize) -> String {
    format!("AAAAB3NzaC1yc2EAAAADAQABAAABAQ{i:0>14}")
}

fn fixture() -> String {
    format!(
        "# managed by the operator\n\
         ssh-rsa {} alice\n\
         command=\"ls\",no-pty ssh-rsa {} bob\n\
         from=\"10.0.0.0/8\",no-agent-forwarding,no-X11-forwarding ssh-dss {} carol@laptop\n\
         \n\
         ssh-ed25519 {}\n",
        key(0),
        key(1),
        key(2),
        key(3)
    )
}

fn setup() -> (TempDir, Store) {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("authorized_keys");
    fs::write(&path, fixture()).unwrap();
    let store = Store::new(&path);
    (dir, store)
}

fn contents(store: &Store) -> String {
    fs::read_to_string(store.path()).unwrap()
}

#[test]
fn test_load_all() {
    let (_dir, store) = setup();
    let records = store.all().unwrap();
    assert_eq!(records.len(), 6);
    assert!(records.iter().all(|r| r.saved()));
    assert_eq!(records.iter().filter(|r| r.is_complete()).count(), 4);
    assert_eq!(records[2].command.as_deref(), Some("ls"));
    assert_eq!(records[3].from.as_deref(), Some("10.0.0.0/8"));
    assert_eq!(records[5].key_type.as_deref(), Some("ssh-ed25519"));
    assert_eq!(records[0].raw_line(), Some("# managed by the operator"));
}

#[test]
fn test_missing_file_has_no_records() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::new(dir.path().join("nothing_here"));
    assert!(store.all().unwrap().is_empty());
    assert!(store.find_by_key_data(&key(0)).unwrap().is_none());
}

#[test]
fn test_searchable() {
    let (_dir, store) = setup();
    assert_eq!(
        store.find_all_by(&[(Field::Command, "ls")], false).unwrap().len(),
        1
    );
    assert_eq!(
        store
            .find_all_by(&[(Field::NoX11Forwarding, "true")], false)
            .unwrap()
            .len(),
        1
    );
    assert_eq!(
        store
            .find_all_by(&[(Field::KeyType, "ssh-rsa"), (Field::Note, "bob")], false)
            .unwrap()
            .len(),
        1
    );
    assert!(store
        .find_all_by(&[(Field::KeyType, "ssh-rsa"), (Field::Note, "carol@laptop")], false)
        .unwrap()
        .is_empty());
}

#[test]
fn test_regex_search() {
    let (_dir, store) = setup();
    let found = store
        .find_all_by(&[(Field::KeyType, "^ssh-(rsa|dss)$")], true)
        .unwrap();
    assert_eq!(found.len(), 3);

    let found = store.find_all_by(&[(Field::Note, "@")], true).unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].note.as_deref(), Some("carol@laptop"));

    // unset fields are searched as empty text
    let found = store.find_all_by(&[(Field::Command, "^$")], true).unwrap();
    assert_eq!(found.len(), 5);

    assert!(matches!(
        store.find_all_by(&[(Field::Note, "(")], true),
        Err(Error::RegexError(_))
    ));
}

#[test]
fn test_write_replaces_only_the_matching_line() {
    let (_dir, store) = setup();
    let before = contents(&store);

    let mut record = store.find_by_key_data(&key(1)).unwrap().unwrap();
    record.command = None;
    record.set_flag(Field::NoPty, false);
    record.set_flag(Field::NoUserRc, true);
    record.note = Some("bob@desk".to_string());
    assert!(store.write(&record, false).unwrap());

    let after = contents(&store);
    let before_lines: Vec<&str> = before.lines().collect();
    let after_lines: Vec<&str> = after.lines().collect();
    assert_eq!(before_lines.len(), after_lines.len());
    for (i, (old, new)) in before_lines.iter().zip(after_lines.iter()).enumerate() {
        if i == 2 {
            assert_eq!(*new, format!("no-user-rc ssh-rsa {} bob@desk", key(1)));
        } else {
            assert_eq!(old, new);
        }
    }
}

#[test]
fn test_write_does_not_add_unknown_keys() {
    let (_dir, store) = setup();
    let before = contents(&store);

    let mut record = Record::new();
    record.key_type = Some("ssh-rsa".to_string());
    record.key_data = Some(key(42));
    assert!(!store.write(&record, false).unwrap());
    assert!(!store.destroy(&record).unwrap());
    assert_eq!(before, contents(&store));
}

#[test]
fn test_write_refuses_unrenderable_record() {
    let (_dir, store) = setup();
    let before = contents(&store);

    let mut record = store.find_by_key_data(&key(0)).unwrap().unwrap();
    record.set_field(Field::NoPty, "bad_data");
    assert!(matches!(
        store.write(&record, false),
        Err(Error::RecordInvalid(_))
    ));
    assert_eq!(before, contents(&store));
}

#[test]
fn test_key_named_in_a_command_is_not_that_line() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("authorized_keys");
    let alice = format!(
        "command=\"echo ssh-rsa {}\" ssh-rsa {} alice\n",
        key(1),
        key(0)
    );
    let bob = format!("ssh-rsa {} bob\n", key(1));
    fs::write(&path, format!("{alice}{bob}")).unwrap();
    let store = Store::new(&path);

    let records = store.all().unwrap();
    assert_eq!(records[0].key_data, Some(key(0)));
    assert_eq!(records[0].note.as_deref(), Some("alice"));

    let bob_record = store.find_by_key_data(&key(1)).unwrap().unwrap();
    assert_eq!(bob_record.note.as_deref(), Some("bob"));
    assert!(store.destroy(&bob_record).unwrap());
    assert_eq!(contents(&store), alice);
}

#[test]
fn test_save_refuses_lines_it_could_not_find_again() {
    let (_dir, store) = setup();
    let before = contents(&store);

    let mut record = Record::new();
    record.key_type = Some("sk-ssh-ed25519@openssh.com".to_string());
    record.key_data = Some(key(8));
    for _ in 0..3 {
        assert!(!store.save(&mut record).unwrap());
    }
    assert!(store.save_or_raise(&mut record).is_err());

    let mut record = Record::parse(&format!("ssh-rsa {}", key(8)));
    record.note = Some("laptop(1)".to_string());
    assert!(!store.save(&mut record).unwrap());
    record.note = Some("laptop1".to_string());
    record.tunnel = Some("tun0".to_string());
    assert!(!store.save(&mut record).unwrap());

    assert_eq!(before, contents(&store));
}

#[test]
fn test_lines_that_are_not_utf8_pass_through() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("authorized_keys");
    let mut original = b"# caf\xe9 key\n".to_vec();
    original.extend_from_slice(format!("ssh-rsa {} alice\n", key(0)).as_bytes());
    original.extend_from_slice(format!("ssh-rsa {} b", key(1)).as_bytes());
    original.extend_from_slice(b"\xf6b\n");
    fs::write(&path, &original).unwrap();
    let store = Store::new(&path);

    let records = store.all().unwrap();
    assert_eq!(records.len(), 3);
    assert_eq!(records[2].key_data, Some(key(1)));

    let mut record = store.find_by_key_data(&key(0)).unwrap().unwrap();
    record.set_flag(Field::NoPty, true);
    assert!(store.write(&record, false).unwrap());

    let mut expected = b"# caf\xe9 key\n".to_vec();
    expected.extend_from_slice(format!("no-pty ssh-rsa {} alice\n", key(0)).as_bytes());
    expected.extend_from_slice(format!("ssh-rsa {} b", key(1)).as_bytes());
    expected.extend_from_slice(b"\xf6b\n");
    assert_eq!(fs::read(&path).unwrap(), expected);
}

#[cfg(unix)]
#[test]
fn test_write_without_a_match_leaves_the_file_alone() {
    use std::os::unix::fs::MetadataExt;
    let (_dir, store) = setup();
    let inode = fs::metadata(store.path()).unwrap().ino();

    let mut record = Record::parse(&format!("ssh-rsa {}", key(42)));
    assert!(!store.write(&record, false).unwrap());
    assert!(!store.destroy(&record).unwrap());
    assert_eq!(fs::metadata(store.path()).unwrap().ino(), inode);

    // an update that does match publishes a new file
    record.key_data = Some(key(0));
    assert!(store.write(&record, false).unwrap());
    assert_ne!(fs::metadata(store.path()).unwrap().ino(), inode);
}

#[test]
fn test_write_to_missing_file_does_not_create_it() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::new(dir.path().join("authorized_keys"));
    let record = Record::parse(&format!("ssh-rsa {}", key(0)));
    assert!(!store.write(&record, false).unwrap());
    assert!(!store.path().exists());
}

#[test]
fn test_save_adds_then_updates() {
    let (_dir, store) = setup();

    let mut record = Record::new();
    record.key_type = Some("ssh-rsa".to_string());
    record.key_data = Some(key(7));
    record.note = Some("dave".to_string());
    assert!(store.save(&mut record).unwrap());
    assert!(record.saved());
    assert_eq!(
        record.raw_line(),
        Some(format!("ssh-rsa {} dave", key(7)).as_str())
    );
    assert_eq!(store.all().unwrap().len(), 7);
    assert!(contents(&store).ends_with(&format!("ssh-rsa {} dave\n", key(7))));

    record.command = Some("uptime".to_string());
    assert!(store.save(&mut record).unwrap());
    assert_eq!(store.all().unwrap().len(), 7);
    let found = store.find_by_key_data(&key(7)).unwrap().unwrap();
    assert_eq!(found.command.as_deref(), Some("uptime"));
    assert_eq!(found.note.as_deref(), Some("dave"));
}

#[test]
fn test_save_into_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::new(dir.path().join("authorized_keys"));

    let mut record = Record::parse(&format!("no-pty ssh-rsa {} first", key(9)));
    assert!(store.save(&mut record).unwrap());
    assert_eq!(
        contents(&store),
        format!("no-pty ssh-rsa {} first\n", key(9))
    );
    assert!(store.lock_path().exists());
}

#[test]
fn test_save_appends_after_unterminated_line() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("authorized_keys");
    fs::write(&path, format!("ssh-rsa {} last", key(0))).unwrap();
    let store = Store::new(&path);

    let mut record = Record::parse(&format!("ssh-rsa {}", key(1)));
    assert!(store.save(&mut record).unwrap());
    assert_eq!(
        contents(&store),
        format!("ssh-rsa {} last\nssh-rsa {}\n", key(0), key(1))
    );
}

#[test]
fn test_save_invalid_record() {
    let (_dir, store) = setup();
    let before = contents(&store);

    let mut record = Record::new();
    assert!(!store.save(&mut record).unwrap());
    assert_eq!(record.errors(), &[FieldError::DataNil]);

    record.key_type = Some("ssh-rsa".to_string());
    record.key_data = Some("baa".repeat(41));
    match store.save_or_raise(&mut record) {
        Err(Error::RecordInvalid(message)) => assert!(message.contains("Errors preventing save")),
        other => panic!("expected RecordInvalid, got {other:?}"),
    }
    assert!(record.errors().contains(&FieldError::DataModulus));
    assert!(!record.saved());
    assert_eq!(before, contents(&store));
}

#[test]
fn test_destroy() {
    let (_dir, store) = setup();

    let record = store.find_by_key_data(&key(2)).unwrap().unwrap();
    assert!(store.destroy(&record).unwrap());
    assert!(store.find_by_key_data(&key(2)).unwrap().is_none());
    assert_eq!(store.all().unwrap().len(), 5);
    // comment and blank lines survive
    assert!(contents(&store).starts_with("# managed by the operator\n"));
    assert!(contents(&store).contains("\n\n"));
}

#[test]
fn test_remove_needs_a_saved_record() {
    let (_dir, store) = setup();
    let before = contents(&store);

    let mut fresh = Record::new();
    fresh.key_type = Some("ssh-rsa".to_string());
    fresh.key_data = Some(key(0));
    assert!(!store.remove(&mut fresh).unwrap());
    assert_eq!(before, contents(&store));

    let mut loaded = store.find_by_key_data(&key(0)).unwrap().unwrap();
    assert!(store.remove(&mut loaded).unwrap());
    assert!(!loaded.saved());
    assert!(store.find_by_key_data(&key(0)).unwrap().is_none());
}

#[test]
fn test_explicit_lock_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("authorized_keys");
    let lock = dir.path().join("keys.lock");
    let store = Store::with_lock_path(&path, &lock);

    let mut record = Record::parse(&format!("ssh-rsa {}", key(5)));
    assert!(store.save(&mut record).unwrap());
    assert!(lock.exists());
    assert!(!dir.path().join("authorized_keys.lockfile").exists());
}

#[test]
fn test_concurrent_writers_keep_each_others_keys() {
    let (_dir, store) = setup();
    let rounds = 20;

    let handles: Vec<_> = [10, 11]
        .into_iter()
        .map(|i| {
            let store = store.clone();
            thread::spawn(move || {
                let mut record = Record::parse(&format!("ssh-rsa {} writer{i}", key(i)));
                for round in 0..rounds {
                    record.tunnel = Some(round.to_string());
                    assert!(store.save(&mut record).unwrap());
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let records = store.all().unwrap();
    assert_eq!(records.len(), 8);
    for i in [0, 1, 2, 3] {
        assert!(records.iter().any(|r| r.key_data == Some(key(i))));
    }
    for i in [10, 11] {
        let found = store.find_by_key_data(&key(i)).unwrap().unwrap();
        assert_eq!(found.tunnel, Some((rounds - 1).to_string()));
        assert_eq!(found.note, Some(format!("writer{i}")));
    }
}

#[test]
fn test_concurrent_updates_of_different_keys() {
    let (_dir, store) = setup();

    let handles: Vec<_> = [0, 1]
        .into_iter()
        .map(|i| {
            let store = store.clone();
            thread::spawn(move || {
                let mut record = store.find_by_key_data(&key(i)).unwrap().unwrap();
                for round in 0..20 {
                    record.permitopen = Some(format!("localhost:{}", 8000 + round));
                    assert!(store.write(&record, false).unwrap());
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let after = contents(&store);
    assert_eq!(after.lines().count(), 6);
    for i in [0, 1] {
        let found = store.find_by_key_data(&key(i)).unwrap().unwrap();
        assert_eq!(found.permitopen.as_deref(), Some("localhost:8019"));
    }
    let untouched = fixture();
    for line in [3, 4, 5] {
        assert_eq!(after.lines().nth(line), untouched.lines().nth(line));
    }
}

#[test]
fn test_readers_never_see_partial_files() {
    let (_dir, store) = setup();
    let done = Arc::new(AtomicBool::new(false));

    let writer = {
        let store = store.clone();
        let done = done.clone();
        thread::spawn(move || {
            let mut record = store.find_by_key_data(&key(3)).unwrap().unwrap();
            for i in 0..50 {
                record.set_flag(Field::NoPty, i % 2 == 0);
                record.command = Some(format!("echo {}", "x".repeat(i * 10)));
                assert!(store.write(&record, false).unwrap());
            }
            done.store(true, Ordering::SeqCst);
        })
    };

    while !done.load(Ordering::SeqCst) {
        let records = store.all().unwrap();
        assert_eq!(records.len(), 6);
        assert_eq!(records.iter().filter(|r| r.is_complete()).count(), 4);
        let last = &records[5];
        assert_eq!(last.key_data, Some(key(3)));
        assert!(matches!(
            last.no_pty,
            None | Some(FlagValue::Bool(true))
        ));
    }
    writer.join().unwrap();
}
