use super::*;

#[test]
fn test_open_creates_parent_dirs() {
    let tmp = tempfile::TempDir::new().expect("tempdir");
    let path = tmp.path().join("nested/dir/gate.sqlite3");
    let db = Database::open(&path).expect("open db");
    assert!(path.exists());
    let conn = db.conn().expect("lock");
    let n: i64 = conn
        .query_row("SELECT 1", [], |row| row.get(0))
        .expect("query");
    assert_eq!(n, 1);
}

#[test]
fn test_foreign_keys_enabled() {
    let db = Database::open_in_memory().expect("open");
    let conn = db.conn().expect("lock");
    let fk: i64 = conn
        .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
        .expect("pragma");
    assert_eq!(fk, 1);
}
