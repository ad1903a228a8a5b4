mod common;

use common::{setup, user, writes};
use unitwork::prelude::*;
use unitwork::{FlushResult, Row};

#[test]
fn get_twice_returns_the_same_instance() {
    let (engine, metadata) = setup(Cascade::default());
    let mut session = engine.session(metadata);
    let ed = user(&session, "ed");
    session.add(&ed).unwrap();
    session.commit().unwrap();
    let id = session.read(&ed, "id").unwrap();

    let first = session.get("user", id.clone()).unwrap().unwrap();
    let second = session.get("user", id).unwrap().unwrap();
    assert!(Instance::ptr_eq(&first, &second));
    assert!(Instance::ptr_eq(&first, &ed));

    first.set("fullname", "Ed Jones").unwrap();
    assert_eq!(second.get("fullname"), Some(Value::from("Ed Jones")));
}

#[test]
fn get_after_flush_skips_the_store() {
    let (engine, metadata) = setup(Cascade::default());
    let mut session = engine.session(metadata);
    let ed = user(&session, "ed");
    session.add(&ed).unwrap();
    session.flush().unwrap();

    let id = ed.get("id").unwrap();
    assert!(id.as_i64().is_some());
    engine.clear_echo_log();
    let found = session.get("user", id).unwrap().unwrap();
    assert!(Instance::ptr_eq(&found, &ed));
    assert!(engine.echo_log().is_empty());
}

#[test]
fn flush_after_commit_is_a_noop() {
    let (engine, metadata) = setup(Cascade::default());
    let mut session = engine.session(metadata);
    let ed = user(&session, "ed");
    let wendy = user(&session, "wendy");
    session.add_all([&ed, &wendy]).unwrap();
    session.commit().unwrap();
    engine.clear_echo_log();

    assert_eq!(session.flush().unwrap(), FlushResult::default());
    assert!(writes(&engine).is_empty());
}

#[test]
fn query_rows_resolve_to_tracked_instances() {
    let (engine, metadata) = setup(Cascade::default());
    let mut session = engine.session(metadata);
    let ed = user(&session, "ed");
    let wendy = user(&session, "wendy");
    session.add_all([&ed, &wendy]).unwrap();
    session.commit().unwrap();

    let all = session.query("user").unwrap().order_by("name").all().unwrap();
    assert_eq!(all.len(), 2);
    assert!(Instance::ptr_eq(&all[0], &ed));
    assert!(Instance::ptr_eq(&all[1], &wendy));
    assert_eq!(session.identity_map().len(), 2);
}

#[test]
fn query_cardinality_errors() {
    let (engine, metadata) = setup(Cascade::default());
    let mut session = engine.session(metadata);
    let ed = user(&session, "ed");
    let other_ed = user(&session, "ed");
    session.add_all([&ed, &other_ed]).unwrap();

    let err = session
        .query("user")
        .unwrap()
        .filter_by("name", "ed")
        .one()
        .unwrap_err();
    assert!(matches!(err, Error::MultipleResults { count: 2, .. }));

    let err = session
        .query("user")
        .unwrap()
        .filter_by("name", "mary")
        .one()
        .unwrap_err();
    assert!(matches!(err, Error::NoResult { .. }));
    assert_eq!(session.query("user").unwrap().count().unwrap(), 2);
}

#[derive(Debug, Clone, PartialEq)]
struct User {
    id: Option<i64>,
    name: String,
    fullname: Option<String>,
}

impl Model for User {
    const TABLE_NAME: &'static str = "user";

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("id", self.id.into()),
            ("name", self.name.clone().into()),
            ("fullname", self.fullname.clone().into()),
        ]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.get_named("id")?,
            name: row.get_named("name")?,
            fullname: row.get_named("fullname")?,
        })
    }
}

#[test]
fn typed_models_round_trip_through_a_session() {
    let (engine, metadata) = setup(Cascade::default());
    let mut session = engine.session(metadata);
    let table = session.metadata().require_table("user").unwrap().clone();
    let model = User {
        id: None,
        name: "ed".into(),
        fullname: Some("Ed Jones".into()),
    };
    let ed = Instance::from_model(&table, &model).unwrap();
    session.add(&ed).unwrap();
    session.commit().unwrap();

    assert!(ed.to_model::<User>().is_err());
    session.load(&ed).unwrap();
    let back: User = ed.to_model().unwrap();
    assert!(back.id.is_some());
    assert_eq!(back.name, model.name);
    assert_eq!(back.fullname, model.fullname);

    let address = session.metadata().require_table("address").unwrap().clone();
    assert!(Instance::from_model(&address, &model).is_err());
}
