mod common;

use common::{address, setup, user, writes};
use std::cell::RefCell;
use std::rc::Rc;
use unitwork::prelude::*;
use unitwork::{Connection, Predicate, SessionEvent, Statement, TransactionErrorKind};

#[test]
fn rollback_evicts_pending_and_restores_dirty() {
    let (engine, metadata) = setup(Cascade::default());
    let mut session = engine.session(metadata);
    let ed = user(&session, "ed");
    session.add(&ed).unwrap();
    session.commit().unwrap();

    session.read(&ed, "name").unwrap();
    ed.set("name", "edwardo").unwrap();
    let fake = user(&session, "fakeuser");
    session.add(&fake).unwrap();
    let found = session
        .query("user")
        .unwrap()
        .filter_in("name", ["edwardo", "fakeuser"])
        .all()
        .unwrap();
    assert_eq!(found.len(), 2);

    session.rollback().unwrap();
    assert_eq!(session.state_of(&fake), InstanceState::Transient);
    assert!(!session.contains(&fake));
    assert_eq!(session.read(&ed, "name").unwrap(), Value::from("ed"));
    assert_eq!(engine.row_count("user"), Some(1));
    assert_eq!(
        session.query("user").unwrap().filter_by("name", "fakeuser").count().unwrap(),
        0
    );
}

#[test]
fn rollback_before_flush_then_re_add() {
    let (engine, metadata) = setup(Cascade::default());
    let mut session = engine.session(metadata);
    let ed = user(&session, "ed");
    session.add(&ed).unwrap();
    session.rollback().unwrap();
    assert!(session.new_instances().is_empty());
    assert!(writes(&engine).is_empty());

    session.add(&ed).unwrap();
    session.commit().unwrap();
    assert_eq!(session.state_of(&ed), InstanceState::Persistent);
    assert_eq!(engine.row_count("user"), Some(1));
}

#[test]
fn rolled_back_insert_gets_a_new_key_on_re_add() {
    let (engine, metadata) = setup(Cascade::default());
    let mut session = engine.session(metadata);
    let ed = user(&session, "ed");
    session.add(&ed).unwrap();
    session.flush().unwrap();
    assert!(ed.identity_key().is_some());

    session.rollback().unwrap();
    assert!(ed.identity_key().is_none());
    assert_eq!(ed.get("id"), Some(Value::Null));
    assert_eq!(ed.get("name"), Some(Value::from("ed")));

    session.add(&ed).unwrap();
    session.commit().unwrap();
    assert_eq!(engine.row_count("user"), Some(1));
}

#[test]
fn commit_then_read_reloads_from_the_store() {
    let (engine, metadata) = setup(Cascade::default());
    let mut session = engine.session(metadata);
    let ed = user(&session, "ed");
    session.add(&ed).unwrap();
    session.commit().unwrap();
    assert!(ed.is_expired());

    let id = session.read(&ed, "id").unwrap();
    engine
        .begin(|conn| {
            conn.execute(&Statement::Update {
                table: "user".into(),
                assignments: vec![("name".into(), "edward".into())],
                predicates: vec![Predicate::eq("id", id.clone())],
            })
        })
        .unwrap();

    assert_eq!(ed.get("name"), Some(Value::from("ed")));
    session.commit().unwrap();
    assert_eq!(session.read(&ed, "name").unwrap(), Value::from("edward"));
}

#[test]
fn expire_on_commit_can_be_disabled() {
    let (engine, metadata) = setup(Cascade::default());
    let mut session = SessionBuilder::new()
        .expire_on_commit(false)
        .build_with(engine.clone(), metadata);
    let ed = user(&session, "ed");
    session.add(&ed).unwrap();
    session.commit().unwrap();
    engine.clear_echo_log();

    assert!(!ed.is_expired());
    assert_eq!(ed.get("name"), Some(Value::from("ed")));
    assert!(engine.echo_log().is_empty());
}

#[test]
fn store_rejection_requires_rollback() {
    let (engine, metadata) = setup(Cascade::default());
    let mut session = engine.session(metadata);
    let ed = user(&session, "ed");
    session.add(&ed).unwrap();
    session.commit().unwrap();

    let bad = address(&session, "x@y.com");
    bad.set("email_address", Value::Null).unwrap();
    session.add(&bad).unwrap();
    let err = session.commit().unwrap_err();
    assert_eq!(err.flush_kind(), Some(FlushErrorKind::StoreRejected));
    assert_eq!(session.state(), SessionState::Failed);

    for err in [
        session.flush().unwrap_err(),
        session.query("user").unwrap().all().unwrap_err(),
        session.delete(&ed).unwrap_err(),
    ] {
        assert!(matches!(
            err,
            Error::Transaction(ref t) if t.kind == TransactionErrorKind::Inactive
        ));
    }

    session.rollback().unwrap();
    assert_eq!(session.state(), SessionState::NoTransaction);
    assert_eq!(session.read(&ed, "name").unwrap(), Value::from("ed"));
    assert_eq!(engine.row_count("address"), Some(0));
}

#[test]
fn exhausted_key_space_is_a_store_rejection() {
    let (engine, metadata) = setup(Cascade::default());
    engine
        .begin(|conn| {
            conn.execute(&Statement::Insert {
                table: "user".into(),
                columns: vec!["id".into(), "name".into()],
                values: vec![Value::BigInt(i64::MAX), "max".into()],
            })
        })
        .unwrap();

    let mut session = engine.session(metadata);
    let ed = user(&session, "ed");
    session.add(&ed).unwrap();
    let err = session.commit().unwrap_err();
    assert_eq!(err.flush_kind(), Some(FlushErrorKind::StoreRejected));
    assert_eq!(session.state(), SessionState::Failed);

    session.rollback().unwrap();
    assert_eq!(session.state_of(&ed), InstanceState::Transient);
    assert_eq!(engine.row_count("user"), Some(1));
}

#[test]
fn concurrent_delete_surfaces_as_stale_row() {
    let (engine, metadata) = setup(Cascade::default());
    let mut session = engine.session(metadata.clone());
    let ed = user(&session, "ed");
    session.add(&ed).unwrap();
    session.commit().unwrap();

    let mut other = engine.session(metadata);
    let copy = other.query("user").unwrap().one().unwrap();
    other.delete(&copy).unwrap();
    other.commit().unwrap();

    let err = session.read(&ed, "name").unwrap_err();
    assert!(matches!(err, Error::StaleRow { .. }));
}

#[test]
fn events_fire_in_order() {
    let (engine, metadata) = setup(Cascade::default());
    let mut session = engine.session(metadata);
    let seen = Rc::new(RefCell::new(Vec::new()));
    for (name, event) in [
        ("before_flush", SessionEvent::BeforeFlush),
        ("after_flush", SessionEvent::AfterFlush),
        ("before_commit", SessionEvent::BeforeCommit),
        ("after_commit", SessionEvent::AfterCommit),
        ("after_rollback", SessionEvent::AfterRollback),
    ] {
        let seen = Rc::clone(&seen);
        let record = move || -> Result<()> {
            seen.borrow_mut().push(name);
            Ok(())
        };
        match event {
            SessionEvent::BeforeFlush => session.on_before_flush(record),
            SessionEvent::AfterFlush => session.on_after_flush(record),
            SessionEvent::BeforeCommit => session.on_before_commit(record),
            SessionEvent::AfterCommit => session.on_after_commit(record),
            SessionEvent::AfterRollback => session.on_after_rollback(record),
        }
    }

    let ed = user(&session, "ed");
    session.add(&ed).unwrap();
    session.commit().unwrap();
    session.rollback().unwrap();
    assert_eq!(
        *seen.borrow(),
        vec![
            "before_flush",
            "after_flush",
            "before_commit",
            "after_commit",
            "after_rollback"
        ]
    );
}

#[test]
fn scoped_engine_transactions() {
    let (engine, _metadata) = setup(Cascade::default());
    let insert = Statement::Insert {
        table: "user".into(),
        columns: vec!["name".into()],
        values: vec!["ed".into()],
    };

    engine.begin(|conn| conn.execute(&insert)).unwrap();
    assert_eq!(engine.row_count("user"), Some(1));

    let err = engine
        .begin(|conn| {
            conn.execute(&insert)?;
            Err::<(), _>(Error::Custom("abandon".into()))
        })
        .unwrap_err();
    assert!(matches!(err, Error::Custom(_)));
    assert_eq!(engine.row_count("user"), Some(1));
    assert_eq!(
        engine.echo_log().iter().filter(|s| *s == "ROLLBACK").count(),
        1
    );
}
