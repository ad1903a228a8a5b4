#![allow(dead_code)]

use std::sync::Arc;
use unitwork::prelude::*;

/// `user` 1-N `address`, with `cascade` on the `addresses` collection.
pub fn setup(cascade: Cascade) -> (Engine, Arc<MetaData>) {
    let mut metadata = MetaData::new();
    metadata
        .add_table(
            Table::builder("user")
                .column(Column::new("id", SqlType::Integer).primary_key())
                .column(Column::new("name", SqlType::VarChar(50)))
                .column(Column::new("fullname", SqlType::VarChar(50)))
                .relationship(
                    Relationship::one_to_many("addresses", "address", "user_id")
                        .cascade(cascade)
                        .back_populates("user"),
                )
                .build()
                .unwrap(),
        )
        .unwrap();
    metadata
        .add_table(
            Table::builder("address")
                .column(Column::new("id", SqlType::Integer).primary_key())
                .column(Column::new("email_address", SqlType::VarChar(100)).not_null())
                .column(Column::new("user_id", SqlType::Integer).foreign_key("user.id"))
                .relationship(
                    Relationship::many_to_one("user", "user", "user_id")
                        .back_populates("addresses"),
                )
                .build()
                .unwrap(),
        )
        .unwrap();

    let engine = create_engine("memory://?echo=true").unwrap();
    engine.create_all(&metadata).unwrap();
    engine.clear_echo_log();
    (engine, Arc::new(metadata))
}

pub fn user(session: &Session, name: &str) -> Instance {
    let table = session.metadata().require_table("user").unwrap();
    Instance::with_values(table, [("name", name)]).unwrap()
}

pub fn address(session: &Session, email: &str) -> Instance {
    let table = session.metadata().require_table("address").unwrap();
    Instance::with_values(table, [("email_address", email)]).unwrap()
}

/// Echoed statements other than SELECTs.
pub fn writes(engine: &Engine) -> Vec<String> {
    engine
        .echo_log()
        .into_iter()
        .filter(|s| !s.starts_with("SELECT"))
        .collect()
}

/// A user with two addresses, committed. The instances are expired.
pub fn committed_family(session: &mut Session) -> (Instance, Instance, Instance) {
    let jack = user(session, "jack");
    let a1 = address(session, "jack@google.com");
    let a2 = address(session, "j25@yahoo.com");
    jack.append("addresses", &a1).unwrap();
    jack.append("addresses", &a2).unwrap();
    session.add(&jack).unwrap();
    session.commit().unwrap();
    (jack, a1, a2)
}
