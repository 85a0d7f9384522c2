use pstore_api::Repository;
use pstore_core::{Context, Direction, Query, Value};
use pstore_test_utils::*;

#[test]
fn test_records_survive_reopen() {
    init_tracing();
    let file = TestSqliteFile::new();
    let ctx = Context::background();

    {
        let repo = file.open().unwrap();
        let outcome = repo.create_batch(&ctx, &mut ten_people()).unwrap();
        assert_eq!(outcome.inserted, 10);
        assert!(outcome.is_complete());
    }

    let repo = file.open().unwrap();
    assert_eq!(repo.count(&ctx, &Query::new()).unwrap(), 10);
    let oldest: Person = repo
        .find_all(&ctx, &Query::new().order_by("age", Direction::Desc).limit(1))
        .unwrap()
        .remove(0);
    assert_eq!(oldest.id, "p10");
}

#[test]
fn test_batch_is_all_or_nothing() {
    let file = TestSqliteFile::new();
    let ctx = Context::background();
    let repo = file.open().unwrap();

    let mut people = ten_people();
    people[7].id = people[2].id.clone();
    let err = repo.create_batch(&ctx, &mut people).unwrap_err();
    assert_eq!(err.kind(), pstore_core::ErrorKind::Duplicate);
    assert_eq!(repo.count(&ctx, &Query::new()).unwrap(), 0);
}

#[test]
fn test_two_repositories_share_one_file() {
    let file = TestSqliteFile::new();
    let ctx = Context::background();
    let writer = file.open().unwrap();
    let reader = file.open().unwrap();

    writer
        .create(&ctx, &mut Person::new("a", "amy", 20, "active"))
        .unwrap();
    let amy: Person = reader.find_by_id(&ctx, &Value::string("a")).unwrap();
    assert_eq!(amy.name, "amy");
}
