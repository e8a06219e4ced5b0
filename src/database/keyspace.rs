//! Keyspace Commands
//!
//! Key lifecycle and introspection: DEL/EXISTS, the EXPIRE family backed by
//! the time wheel, TTL readout, glob-matched KEYS, TYPE, and the database
//! sweepers FLUSHDB/DBSIZE.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;

use crate::database::db::{DataGroup, Db};
use crate::database::entity::from_unix_millis;
use crate::database::registry::{
    no_keys, read_all_keys, read_first_key, undo_all_keys, undo_first_key, write_all_keys,
    write_first_key, CommandExtra, CommandTable, FLAG_READONLY, FLAG_WRITE,
};
use crate::database::{arg_str, parse_i64};
use crate::protocol::Reply;

pub fn register(table: &mut CommandTable) {
    table.register(
        "del",
        -2,
        FLAG_WRITE,
        write_all_keys,
        exec_del,
        Some(undo_all_keys),
        Some(CommandExtra { signs: &["write"], first_key: 1, last_key: -1, key_step: 1 }),
    );
    table.register(
        "exists",
        -2,
        FLAG_READONLY,
        read_all_keys,
        exec_exists,
        None,
        Some(CommandExtra { signs: &["readonly", "fast"], first_key: 1, last_key: -1, key_step: 1 }),
    );
    table.register(
        "expire",
        3,
        FLAG_WRITE,
        write_first_key,
        exec_expire,
        Some(undo_first_key),
        Some(CommandExtra { signs: &["write", "fast"], first_key: 1, last_key: 1, key_step: 1 }),
    );
    table.register(
        "pexpire",
        3,
        FLAG_WRITE,
        write_first_key,
        exec_pexpire,
        Some(undo_first_key),
        Some(CommandExtra { signs: &["write", "fast"], first_key: 1, last_key: 1, key_step: 1 }),
    );
    table.register(
        "expireat",
        3,
        FLAG_WRITE,
        write_first_key,
        exec_expireat,
        Some(undo_first_key),
        Some(CommandExtra { signs: &["write", "fast"], first_key: 1, last_key: 1, key_step: 1 }),
    );
    table.register(
        "pexpireat",
        3,
        FLAG_WRITE,
        write_first_key,
        exec_pexpireat,
        Some(undo_first_key),
        Some(CommandExtra { signs: &["write", "fast"], first_key: 1, last_key: 1, key_step: 1 }),
    );
    table.register(
        "ttl",
        2,
        FLAG_READONLY,
        read_first_key,
        exec_ttl,
        None,
        Some(CommandExtra { signs: &["readonly", "fast"], first_key: 1, last_key: 1, key_step: 1 }),
    );
    table.register(
        "pttl",
        2,
        FLAG_READONLY,
        read_first_key,
        exec_pttl,
        None,
        Some(CommandExtra { signs: &["readonly", "fast"], first_key: 1, last_key: 1, key_step: 1 }),
    );
    table.register(
        "persist",
        2,
        FLAG_WRITE,
        write_first_key,
        exec_persist,
        Some(undo_first_key),
        Some(CommandExtra { signs: &["write", "fast"], first_key: 1, last_key: 1, key_step: 1 }),
    );
    table.register(
        "type",
        2,
        FLAG_READONLY,
        read_first_key,
        exec_type,
        None,
        Some(CommandExtra { signs: &["readonly", "fast"], first_key: 1, last_key: 1, key_step: 1 }),
    );
    table.register("keys", 2, FLAG_READONLY, no_keys, exec_keys, None, None);
    table.register("flushdb", -1, FLAG_WRITE, no_keys, exec_flushdb, None, None);
    table.register("dbsize", 1, FLAG_READONLY, no_keys, exec_dbsize, None, None);
}

fn exec_del(db: &Arc<Db>, group: &mut DataGroup<'_>, args: &[Bytes]) -> Reply {
    let mut deleted = 0;
    for arg in args {
        let key = arg_str(arg);
        // An already-expired key does not count as deleted.
        db.prune_expired(group, &key);
        if db.remove_entity(group, &key).is_some() {
            deleted += 1;
        }
    }
    Reply::integer(deleted)
}

fn exec_exists(db: &Arc<Db>, group: &mut DataGroup<'_>, args: &[Bytes]) -> Reply {
    let found = args
        .iter()
        .filter(|arg| db.get_entity(group, &arg_str(arg)).is_some())
        .count();
    Reply::integer(found as i64)
}

fn exec_expire(db: &Arc<Db>, group: &mut DataGroup<'_>, args: &[Bytes]) -> Reply {
    match parse_i64(&args[1]) {
        Some(seconds) => expire_relative(db, group, args, seconds.saturating_mul(1000)),
        None => Reply::error("ERR value is not an integer or out of range"),
    }
}

fn exec_pexpire(db: &Arc<Db>, group: &mut DataGroup<'_>, args: &[Bytes]) -> Reply {
    match parse_i64(&args[1]) {
        Some(ms) => expire_relative(db, group, args, ms),
        None => Reply::error("ERR value is not an integer or out of range"),
    }
}

fn expire_relative(db: &Arc<Db>, group: &mut DataGroup<'_>, args: &[Bytes], ms: i64) -> Reply {
    let key = arg_str(&args[0]);
    if db.get_entity(group, &key).is_none() {
        return Reply::integer(0);
    }
    if ms <= 0 {
        // A non-positive ttl deletes the key outright.
        db.remove_entity(group, &key);
        return Reply::integer(1);
    }
    db.expire(&key, SystemTime::now() + Duration::from_millis(ms as u64));
    Reply::integer(1)
}

fn exec_expireat(db: &Arc<Db>, group: &mut DataGroup<'_>, args: &[Bytes]) -> Reply {
    match parse_i64(&args[1]) {
        Some(seconds) => expire_absolute(db, group, args, seconds.saturating_mul(1000)),
        None => Reply::error("ERR value is not an integer or out of range"),
    }
}

fn exec_pexpireat(db: &Arc<Db>, group: &mut DataGroup<'_>, args: &[Bytes]) -> Reply {
    match parse_i64(&args[1]) {
        Some(ms) => expire_absolute(db, group, args, ms),
        None => Reply::error("ERR value is not an integer or out of range"),
    }
}

fn expire_absolute(db: &Arc<Db>, group: &mut DataGroup<'_>, args: &[Bytes], unix_ms: i64) -> Reply {
    let key = arg_str(&args[0]);
    if db.get_entity(group, &key).is_none() {
        return Reply::integer(0);
    }
    db.expire(&key, from_unix_millis(unix_ms.max(0) as u64));
    Reply::integer(1)
}

fn exec_ttl(db: &Arc<Db>, group: &mut DataGroup<'_>, args: &[Bytes]) -> Reply {
    remaining_ttl(db, group, args, 1000)
}

fn exec_pttl(db: &Arc<Db>, group: &mut DataGroup<'_>, args: &[Bytes]) -> Reply {
    remaining_ttl(db, group, args, 1)
}

fn remaining_ttl(db: &Arc<Db>, group: &mut DataGroup<'_>, args: &[Bytes], unit_ms: u128) -> Reply {
    let key = arg_str(&args[0]);
    if db.get_entity(group, &key).is_none() {
        return Reply::integer(-2);
    }
    match db.expiration_of(&key) {
        None => Reply::integer(-1),
        Some(at) => {
            let remaining = at
                .duration_since(SystemTime::now())
                .unwrap_or(Duration::ZERO)
                .as_millis();
            Reply::integer((remaining / unit_ms) as i64)
        }
    }
}

fn exec_persist(db: &Arc<Db>, group: &mut DataGroup<'_>, args: &[Bytes]) -> Reply {
    let key = arg_str(&args[0]);
    if db.get_entity(group, &key).is_none() {
        return Reply::integer(0);
    }
    Reply::integer(i64::from(db.persist_key(&key)))
}

fn exec_type(db: &Arc<Db>, group: &mut DataGroup<'_>, args: &[Bytes]) -> Reply {
    let key = arg_str(&args[0]);
    match db.get_entity(group, &key) {
        Some(entity) => Reply::status(entity.type_name()),
        None => Reply::status("none"),
    }
}

fn exec_keys(db: &Arc<Db>, _group: &mut DataGroup<'_>, args: &[Bytes]) -> Reply {
    let pattern = args[0].clone();
    let now = SystemTime::now();
    let mut keys = Vec::new();
    // Scans shard by shard; no individual key locks were prepared.
    db.for_each_entity(|key, _, expire| {
        let live = expire.map(|at| now <= at).unwrap_or(true);
        if live && matches_pattern(&pattern, key.as_bytes()) {
            keys.push(Bytes::copy_from_slice(key.as_bytes()));
        }
        true
    });
    Reply::MultiBulk(keys)
}

fn exec_flushdb(db: &Arc<Db>, _group: &mut DataGroup<'_>, _args: &[Bytes]) -> Reply {
    db.flush();
    Reply::ok()
}

fn exec_dbsize(db: &Arc<Db>, _group: &mut DataGroup<'_>, _args: &[Bytes]) -> Reply {
    Reply::integer(db.key_count() as i64)
}

/// Minimal glob matcher for KEYS: `*`, `?`, `[...]` (with `^` negation and
/// ranges) and backslash escapes.
fn matches_pattern(pattern: &[u8], text: &[u8]) -> bool {
    if pattern.is_empty() {
        return text.is_empty();
    }
    match pattern[0] {
        b'*' => {
            (0..=text.len()).any(|skip| matches_pattern(&pattern[1..], &text[skip..]))
        }
        b'?' => !text.is_empty() && matches_pattern(&pattern[1..], &text[1..]),
        b'[' => {
            let Some(close) = pattern.iter().position(|b| *b == b']') else {
                return false;
            };
            if text.is_empty() {
                return false;
            }
            let negate = pattern.get(1) == Some(&b'^');
            let class = &pattern[if negate { 2 } else { 1 }..close];
            let mut hit = false;
            let mut i = 0;
            while i < class.len() {
                if i + 2 < class.len() && class[i + 1] == b'-' {
                    if (class[i]..=class[i + 2]).contains(&text[0]) {
                        hit = true;
                    }
                    i += 3;
                } else {
                    if class[i] == text[0] {
                        hit = true;
                    }
                    i += 1;
                }
            }
            if hit == negate {
                return false;
            }
            matches_pattern(&pattern[close + 1..], &text[1..])
        }
        b'\\' if pattern.len() > 1 => {
            !text.is_empty() && pattern[1] == text[0] && matches_pattern(&pattern[2..], &text[1..])
        }
        literal => !text.is_empty() && literal == text[0] && matches_pattern(&pattern[1..], &text[1..]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use crate::database::registry::CommandTable;
    use crate::protocol::cmd_line;
    use crate::timewheel::TimeWheel;

    fn test_db() -> Arc<Db> {
        let wheel = Arc::new(TimeWheel::new(Duration::from_millis(20), 16));
        Db::new(0, CommandTable::standard(), wheel)
    }

    fn exec(db: &Arc<Db>, parts: &[&str]) -> Reply {
        let (conn, _) = Connection::fake();
        db.exec(&conn, &cmd_line(parts))
    }

    #[test]
    fn test_del_and_exists() {
        let db = test_db();
        exec(&db, &["SET", "a", "1"]);
        exec(&db, &["SET", "b", "2"]);
        assert_eq!(exec(&db, &["EXISTS", "a", "b", "c"]), Reply::integer(2));
        assert_eq!(exec(&db, &["DEL", "a", "c"]), Reply::integer(1));
        assert_eq!(exec(&db, &["EXISTS", "a"]), Reply::integer(0));
    }

    #[test]
    fn test_expire_and_ttl_readout() {
        let db = test_db();
        exec(&db, &["SET", "k", "v"]);
        assert_eq!(exec(&db, &["TTL", "k"]), Reply::integer(-1));
        assert_eq!(exec(&db, &["EXPIRE", "k", "100"]), Reply::integer(1));
        match exec(&db, &["TTL", "k"]) {
            Reply::Integer(ttl) => assert!(ttl > 0 && ttl <= 100),
            other => panic!("expected integer, got {:?}", other),
        }
        match exec(&db, &["PTTL", "k"]) {
            Reply::Integer(pttl) => assert!(pttl > 90_000 && pttl <= 100_000),
            other => panic!("expected integer, got {:?}", other),
        }
        assert_eq!(exec(&db, &["TTL", "missing"]), Reply::integer(-2));
        assert_eq!(exec(&db, &["EXPIRE", "missing", "10"]), Reply::integer(0));
    }

    #[test]
    fn test_pexpire_expires_key() {
        let db = test_db();
        exec(&db, &["SET", "k", "v"]);
        assert_eq!(exec(&db, &["PEXPIRE", "k", "100"]), Reply::integer(1));
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(exec(&db, &["GET", "k"]), Reply::Null);
        assert_eq!(exec(&db, &["GET", "k"]), Reply::Null);
    }

    #[test]
    fn test_nonpositive_ttl_deletes() {
        let db = test_db();
        exec(&db, &["SET", "k", "v"]);
        assert_eq!(exec(&db, &["EXPIRE", "k", "-1"]), Reply::integer(1));
        assert_eq!(exec(&db, &["EXISTS", "k"]), Reply::integer(0));
    }

    #[test]
    fn test_persist() {
        let db = test_db();
        exec(&db, &["SET", "k", "v"]);
        exec(&db, &["EXPIRE", "k", "100"]);
        assert_eq!(exec(&db, &["PERSIST", "k"]), Reply::integer(1));
        assert_eq!(exec(&db, &["PERSIST", "k"]), Reply::integer(0));
        assert_eq!(exec(&db, &["TTL", "k"]), Reply::integer(-1));
        assert_eq!(exec(&db, &["PERSIST", "missing"]), Reply::integer(0));
    }

    #[test]
    fn test_type_and_dbsize() {
        let db = test_db();
        exec(&db, &["SET", "s", "v"]);
        exec(&db, &["RPUSH", "l", "a"]);
        assert_eq!(exec(&db, &["TYPE", "s"]), Reply::status("string"));
        assert_eq!(exec(&db, &["TYPE", "l"]), Reply::status("list"));
        assert_eq!(exec(&db, &["TYPE", "missing"]), Reply::status("none"));
        assert_eq!(exec(&db, &["DBSIZE"]), Reply::integer(2));
    }

    #[test]
    fn test_flushdb() {
        let db = test_db();
        exec(&db, &["MSET", "a", "1", "b", "2"]);
        assert_eq!(exec(&db, &["FLUSHDB"]), Reply::ok());
        assert_eq!(exec(&db, &["DBSIZE"]), Reply::integer(0));
        assert_eq!(exec(&db, &["GET", "a"]), Reply::Null);
    }

    #[test]
    fn test_keys_glob() {
        let db = test_db();
        for key in ["hello", "hallo", "hxllo", "world"] {
            exec(&db, &["SET", key, "1"]);
        }
        match exec(&db, &["KEYS", "h?llo"]) {
            Reply::MultiBulk(keys) => assert_eq!(keys.len(), 3),
            other => panic!("expected multi bulk, got {:?}", other),
        }
        match exec(&db, &["KEYS", "*"]) {
            Reply::MultiBulk(keys) => assert_eq!(keys.len(), 4),
            other => panic!("expected multi bulk, got {:?}", other),
        }
    }

    #[test]
    fn test_glob_matcher() {
        assert!(matches_pattern(b"*", b""));
        assert!(matches_pattern(b"h*llo", b"heeello"));
        assert!(matches_pattern(b"h?llo", b"hallo"));
        assert!(!matches_pattern(b"h?llo", b"hllo"));
        assert!(matches_pattern(b"h[ae]llo", b"hello"));
        assert!(!matches_pattern(b"h[ae]llo", b"hillo"));
        assert!(matches_pattern(b"h[^i]llo", b"hallo"));
        assert!(matches_pattern(b"h[a-c]llo", b"hbllo"));
        assert!(matches_pattern(b"h\\*llo", b"h*llo"));
        assert!(!matches_pattern(b"h\\*llo", b"hxllo"));
    }
}
