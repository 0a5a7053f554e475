use issuelog_core::{
    DatabaseConfig, IssueRepository, KeyValueRepository, RepoError, Session, SqlIssueRepository,
    TitleAuthor,
};
use std::collections::HashSet;
use uuid::Uuid;

fn sample_rows() -> Vec<TitleAuthor> {
    vec![
        TitleAuthor::new("Bulk 1", "Loader"),
        TitleAuthor::new("Bulk 2", "Loader"),
        TitleAuthor::new("Bulk 3", "Loader"),
    ]
}

#[test]
fn bulk_rows_are_visible_to_repository_reads() {
    let dir = tempfile::tempdir().unwrap();
    let session = Session::open(&DatabaseConfig::at(dir.path().join("issues.db"))).unwrap();
    let bulk = KeyValueRepository::new(&session);
    let repo = SqlIssueRepository::try_new(&session).unwrap();

    let ids = bulk.bulk_upsert("issues", &sample_rows()).unwrap();

    let stored = repo.find_all().unwrap();
    assert_eq!(stored.len(), 3);
    assert_eq!(
        stored.iter().map(|issue| issue.id).collect::<HashSet<_>>(),
        ids.iter().copied().collect::<HashSet<_>>()
    );
    assert!(stored
        .iter()
        .all(|issue| issue.author.as_deref() == Some("Loader") && issue.links_count == 0));
    assert_eq!(repo.find_by_author("Loader").unwrap().len(), 3);
}

#[test]
fn read_table_returns_rows_ordered_by_id() {
    let session = Session::open_in_memory().unwrap();
    let bulk = KeyValueRepository::new(&session);
    let repo = SqlIssueRepository::try_new(&session).unwrap();

    bulk.bulk_upsert("issues", &sample_rows()).unwrap();
    repo.add_issue("Direct", "Repo").unwrap();

    let table = bulk.read_table("issues").unwrap();
    let keys: Vec<String> = table.iter().map(|issue| issue.id.to_string()).collect();
    let mut sorted = keys.clone();
    sorted.sort();

    assert_eq!(table.len(), 4);
    assert_eq!(keys, sorted);
}

#[test]
fn read_rows_skips_unknown_keys() {
    let session = Session::open_in_memory().unwrap();
    let bulk = KeyValueRepository::new(&session);
    let ids = bulk.bulk_upsert("issues", &sample_rows()).unwrap();

    let rows = bulk
        .read_rows("issues", &[ids[2], Uuid::new_v4(), ids[0]])
        .unwrap();

    assert_eq!(
        rows.iter().map(|issue| issue.id).collect::<HashSet<_>>(),
        HashSet::from([ids[0], ids[2]])
    );
    assert!(bulk.read_rows("issues", &[]).unwrap().is_empty());
}

#[test]
fn table_names_must_be_plain_identifiers() {
    let session = Session::open_in_memory().unwrap();
    let bulk = KeyValueRepository::new(&session);

    let err = bulk
        .bulk_upsert("issues; DROP TABLE links", &sample_rows())
        .unwrap_err();
    assert!(matches!(err, RepoError::InvalidTableName(_)));
    assert!(matches!(
        bulk.read_table("issues\""),
        Err(RepoError::InvalidTableName(_))
    ));
    assert!(bulk.read_table("issues").unwrap().is_empty());
}

#[test]
fn unknown_table_is_an_execution_error() {
    let session = Session::open_in_memory().unwrap();
    let bulk = KeyValueRepository::new(&session);

    let err = bulk.read_table("missing_table").unwrap_err();
    assert!(matches!(err, RepoError::Query(_)));
}
