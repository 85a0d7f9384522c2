use pstore_core::query::opts::*;
use pstore_core::{Context, Direction, Error, ErrorKind, Operator, Query};
use pstore_test_utils::*;

fn ages() -> Vec<Person> {
    vec![
        Person::new("a", "amy", 20, "active"),
        Person::new("b", "ben", 25, "active"),
        Person::new("c", "cat", 30, "closed"),
    ]
}

#[test]
fn test_greater_than_on_every_backend() {
    init_tracing();
    for backend in Backend::ALL {
        let repo = seeded(backend, &ages()).unwrap();
        let query = Query::new().filter(where_("age", Operator::GreaterThan, 22));
        assert_eq!(matching_ids(repo.as_ref(), &query).unwrap(), vec!["b", "c"], "{}", backend);
    }
}

#[test]
fn test_nested_and_or_on_every_backend() {
    init_tracing();
    let people = vec![
        Person::new("a", "amy", 30, "active"),
        Person::new("b", "ben", 20, "active"),
        Person::new("c", "cat", 40, "pending"),
        Person::new("d", "dan", 50, "closed"),
    ];
    let condition = and([
        or([
            where_("status", Operator::Equal, "active"),
            where_("status", Operator::Equal, "pending"),
        ]),
        where_("age", Operator::GreaterThan, 23),
    ]);

    for backend in Backend::ALL {
        let repo = seeded(backend, &people).unwrap();
        let query = Query::new().filter(condition.clone());
        assert_eq!(matching_ids(repo.as_ref(), &query).unwrap(), vec!["a", "c"], "{}", backend);
    }
}

#[test]
fn test_failed_transaction_leaves_nothing_behind() {
    init_tracing();
    let ctx = Context::background();
    for backend in Backend::ALL {
        let repo = person_repository(backend).unwrap();
        let mut ran = false;
        let err = repo
            .transaction(&ctx, &mut |tx| {
                ran = true;
                tx.create(&ctx, &mut Person::new("x", "xan", 33, "active"))?;
                Err(Error::validation("callback failed"))
            })
            .unwrap_err();

        match backend {
            Backend::KeyValue => {
                assert_eq!(err.kind(), ErrorKind::Unsupported);
                assert!(!ran);
            }
            _ => {
                assert_eq!(err.kind(), ErrorKind::Validation, "{}", backend);
                assert!(ran);
            }
        }
        assert_eq!(repo.count(&ctx, &Query::new()).unwrap(), 0, "{}", backend);
    }
}

#[test]
fn test_limit_and_offset_on_every_backend() {
    init_tracing();
    let ctx = Context::background();
    for backend in Backend::ALL {
        let repo = seeded(backend, &ten_people()).unwrap();
        let query = Query::new().order_by("age", Direction::Asc).limit(3).offset(2);
        let ids: Vec<String> = repo
            .find_all(&ctx, &query)
            .unwrap()
            .into_iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(ids, vec!["p03", "p04", "p05"], "{}", backend);
    }
}

#[test]
fn test_option_list_builds_the_same_query() {
    let from_options = Query::from_options([order_by("age", Direction::Desc), limit(2), offset(1)]);
    let built = Query::new().order_by("age", Direction::Desc).limit(2).offset(1);
    assert_eq!(from_options, built);

    let ctx = Context::background();
    for backend in Backend::ALL {
        let repo = seeded(backend, &ten_people()).unwrap();
        let ids: Vec<String> = repo
            .find_all(&ctx, &from_options)
            .unwrap()
            .into_iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(ids, vec!["p09", "p08"], "{}", backend);
    }
}

#[test]
fn test_crud_round_trip_on_every_backend() {
    init_tracing();
    let ctx = Context::background();
    for backend in Backend::ALL {
        let repo = person_repository(backend).unwrap();
        let mut amy = Person::new("a", "amy", 20, "active");
        repo.create(&ctx, &mut amy).unwrap();
        assert_eq!(
            repo.create(&ctx, &mut amy.clone()).unwrap_err().kind(),
            ErrorKind::Duplicate,
            "{}",
            backend
        );

        let id = pstore_core::Value::string("a");
        assert_eq!(repo.find_by_id(&ctx, &id).unwrap(), amy);

        amy.age = 21;
        repo.update(&ctx, &amy).unwrap();
        let fields = pstore_core::ItemBuilder::new().set("status", "closed").build();
        repo.update_partial(&ctx, &id, &fields).unwrap();
        let loaded = repo.find_by_id(&ctx, &id).unwrap();
        assert_eq!((loaded.age, loaded.status.as_str()), (21, "closed"), "{}", backend);

        let row = repo
            .query_one(&ctx, &Query::new().where_("name", Operator::Equal, "amy").select(&["name", "status"]))
            .unwrap();
        assert_eq!(row["status"], pstore_core::Value::string("closed"), "{}", backend);
        assert!(!row.contains_key("age"), "{}", backend);

        repo.delete(&ctx, &id).unwrap();
        assert_eq!(repo.find_by_id(&ctx, &id).unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(repo.delete(&ctx, &id).unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(
            repo.query_one(&ctx, &Query::new()).unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }
}

#[test]
fn test_delete_by_condition_on_every_backend() {
    let ctx = Context::background();
    for backend in Backend::ALL {
        let repo = seeded(backend, &ten_people()).unwrap();
        let query = Query::new().filter(where_("status", Operator::Equal, "active"));
        assert_eq!(repo.delete_by_condition(&ctx, &query).unwrap(), 4, "{}", backend);
        assert_eq!(repo.count(&ctx, &Query::new()).unwrap(), 6, "{}", backend);
        assert!(!repo.exists(&ctx, &query).unwrap(), "{}", backend);
    }
}

#[test]
fn test_grouped_counts_agree() {
    let ctx = Context::background();
    for backend in Backend::ALL {
        let repo = seeded(backend, &ten_people()).unwrap();
        let query = Query::new()
            .group_by(&["status"])
            .order_by("status", Direction::Asc);
        let rows = repo.query(&ctx, &query).unwrap();
        let counts: Vec<(String, i64)> = rows
            .iter()
            .map(|r| {
                (
                    r["status"].as_str().unwrap().to_string(),
                    r[pstore_core::compile::COUNT_FIELD].as_i64().unwrap(),
                )
            })
            .collect();
        assert_eq!(
            counts,
            vec![
                ("active".to_string(), 4),
                ("closed".to_string(), 3),
                ("pending".to_string(), 3)
            ],
            "{}",
            backend
        );
        assert_eq!(repo.count(&ctx, &query).unwrap(), 3, "{}", backend);
    }
}

#[test]
fn test_exists_agrees_with_query_on_every_backend() {
    init_tracing();
    let ctx = Context::background();
    let cases = [
        (Query::new().group_by(&["status"]).having(where_("count", Operator::GreaterThan, 5)), false),
        (Query::new().group_by(&["status"]).having(where_("count", Operator::GreaterThan, 1)), true),
        (Query::new().offset(10), false),
        (Query::new().where_("age", Operator::GreaterThan, 0).offset(2), true),
        (Query::new().select(&["status"]).distinct().offset(1), true),
        (Query::new().select(&["status"]).distinct().offset(2), false),
    ];
    for backend in Backend::ALL {
        let repo = seeded(backend, &ages()).unwrap();
        for (query, expected) in &cases {
            let rows = repo.query(&ctx, query).unwrap();
            let exists = repo.exists(&ctx, query).unwrap();
            assert_eq!(exists, !rows.is_empty(), "{} {:?}", backend, query);
            assert_eq!(exists, *expected, "{} {:?}", backend, query);
        }
    }
}
