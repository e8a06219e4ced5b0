//! String Commands
//!
//! The string family: SET with its EX/PX/NX/XX options, GET, counters, and
//! the multi-key MGET/MSET. Each executor runs under a key group already
//! locked by the engine and satisfies the registry contract: never touch a
//! key the prepare function did not declare.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;

use crate::database::db::{DataGroup, Db};
use crate::database::entity::DataEntity;
use crate::database::registry::{
    read_all_keys, read_first_key, undo_alternate_keys, undo_first_key, write_alternate_keys,
    write_first_key, CommandExtra, CommandTable, FLAG_READONLY, FLAG_WRITE,
};
use crate::database::{arg_str, parse_i64};
use crate::protocol::Reply;

pub fn register(table: &mut CommandTable) {
    table.register(
        "get",
        2,
        FLAG_READONLY,
        read_first_key,
        exec_get,
        None,
        Some(CommandExtra { signs: &["readonly", "fast"], first_key: 1, last_key: 1, key_step: 1 }),
    );
    table.register(
        "set",
        -3,
        FLAG_WRITE,
        write_first_key,
        exec_set,
        Some(undo_first_key),
        Some(CommandExtra { signs: &["write", "denyoom"], first_key: 1, last_key: 1, key_step: 1 }),
    );
    table.register(
        "setnx",
        3,
        FLAG_WRITE,
        write_first_key,
        exec_setnx,
        Some(undo_first_key),
        Some(CommandExtra { signs: &["write", "denyoom", "fast"], first_key: 1, last_key: 1, key_step: 1 }),
    );
    table.register(
        "getset",
        3,
        FLAG_WRITE,
        write_first_key,
        exec_getset,
        Some(undo_first_key),
        Some(CommandExtra { signs: &["write", "denyoom"], first_key: 1, last_key: 1, key_step: 1 }),
    );
    table.register(
        "incr",
        2,
        FLAG_WRITE,
        write_first_key,
        exec_incr,
        Some(undo_first_key),
        Some(CommandExtra { signs: &["write", "denyoom", "fast"], first_key: 1, last_key: 1, key_step: 1 }),
    );
    table.register(
        "incrby",
        3,
        FLAG_WRITE,
        write_first_key,
        exec_incrby,
        Some(undo_first_key),
        Some(CommandExtra { signs: &["write", "denyoom", "fast"], first_key: 1, last_key: 1, key_step: 1 }),
    );
    table.register(
        "decr",
        2,
        FLAG_WRITE,
        write_first_key,
        exec_decr,
        Some(undo_first_key),
        Some(CommandExtra { signs: &["write", "denyoom", "fast"], first_key: 1, last_key: 1, key_step: 1 }),
    );
    table.register(
        "decrby",
        3,
        FLAG_WRITE,
        write_first_key,
        exec_decrby,
        Some(undo_first_key),
        Some(CommandExtra { signs: &["write", "denyoom", "fast"], first_key: 1, last_key: 1, key_step: 1 }),
    );
    table.register(
        "append",
        3,
        FLAG_WRITE,
        write_first_key,
        exec_append,
        Some(undo_first_key),
        Some(CommandExtra { signs: &["write", "denyoom"], first_key: 1, last_key: 1, key_step: 1 }),
    );
    table.register(
        "strlen",
        2,
        FLAG_READONLY,
        read_first_key,
        exec_strlen,
        None,
        Some(CommandExtra { signs: &["readonly", "fast"], first_key: 1, last_key: 1, key_step: 1 }),
    );
    table.register(
        "mget",
        -2,
        FLAG_READONLY,
        read_all_keys,
        exec_mget,
        None,
        Some(CommandExtra { signs: &["readonly", "fast"], first_key: 1, last_key: -1, key_step: 1 }),
    );
    table.register(
        "mset",
        -3,
        FLAG_WRITE,
        write_alternate_keys,
        exec_mset,
        Some(undo_alternate_keys),
        Some(CommandExtra { signs: &["write", "denyoom"], first_key: 1, last_key: -1, key_step: 2 }),
    );
}

fn exec_get(db: &Arc<Db>, group: &mut DataGroup<'_>, args: &[Bytes]) -> Reply {
    let key = arg_str(&args[0]);
    match db.get_entity(group, &key) {
        Some(DataEntity::Bytes(data)) => Reply::Bulk(data.clone()),
        Some(_) => Reply::wrong_type_err(),
        None => Reply::Null,
    }
}

enum SetPolicy {
    Upsert,
    InsertOnly, // NX
    UpdateOnly, // XX
}

fn exec_set(db: &Arc<Db>, group: &mut DataGroup<'_>, args: &[Bytes]) -> Reply {
    let key = arg_str(&args[0]);
    let value = args[1].clone();

    let mut policy = SetPolicy::Upsert;
    let mut ttl: Option<Duration> = None;
    let mut i = 2;
    while i < args.len() {
        match arg_str(&args[i]).to_uppercase().as_str() {
            "NX" => match policy {
                SetPolicy::UpdateOnly => return Reply::syntax_err(),
                _ => policy = SetPolicy::InsertOnly,
            },
            "XX" => match policy {
                SetPolicy::InsertOnly => return Reply::syntax_err(),
                _ => policy = SetPolicy::UpdateOnly,
            },
            "EX" | "PX" => {
                if ttl.is_some() {
                    return Reply::syntax_err();
                }
                let unit_ms = if arg_str(&args[i]).eq_ignore_ascii_case("ex") { 1000 } else { 1 };
                i += 1;
                let amount = match args.get(i).and_then(|a| parse_i64(a)) {
                    Some(n) if n > 0 => n,
                    _ => return Reply::error("ERR invalid expire time in set"),
                };
                ttl = Some(Duration::from_millis(amount as u64 * unit_ms));
            }
            _ => return Reply::syntax_err(),
        }
        i += 1;
    }

    db.prune_expired(group, &key);
    let applied = match policy {
        SetPolicy::Upsert => {
            db.put_entity(group, &key, DataEntity::Bytes(value));
            true
        }
        SetPolicy::InsertOnly => db.put_entity_if_absent(group, &key, DataEntity::Bytes(value)) > 0,
        SetPolicy::UpdateOnly => db.put_entity_if_exists(group, &key, DataEntity::Bytes(value)) > 0,
    };
    if !applied {
        return Reply::Null;
    }
    match ttl {
        Some(ttl) => db.expire(&key, SystemTime::now() + ttl),
        None => {
            db.persist_key(&key);
        }
    }
    Reply::ok()
}

fn exec_setnx(db: &Arc<Db>, group: &mut DataGroup<'_>, args: &[Bytes]) -> Reply {
    let key = arg_str(&args[0]);
    db.prune_expired(group, &key);
    let inserted = db.put_entity_if_absent(group, &key, DataEntity::Bytes(args[1].clone()));
    Reply::integer(inserted as i64)
}

fn exec_getset(db: &Arc<Db>, group: &mut DataGroup<'_>, args: &[Bytes]) -> Reply {
    let key = arg_str(&args[0]);
    db.prune_expired(group, &key);
    let old = group.get(&key).cloned();
    match old {
        Some(DataEntity::Bytes(data)) => {
            db.put_entity(group, &key, DataEntity::Bytes(args[1].clone()));
            db.persist_key(&key);
            Reply::Bulk(data)
        }
        Some(_) => Reply::wrong_type_err(),
        None => {
            db.put_entity(group, &key, DataEntity::Bytes(args[1].clone()));
            Reply::Null
        }
    }
}

fn exec_incr(db: &Arc<Db>, group: &mut DataGroup<'_>, args: &[Bytes]) -> Reply {
    incr_by(db, group, args, 1)
}

fn exec_incrby(db: &Arc<Db>, group: &mut DataGroup<'_>, args: &[Bytes]) -> Reply {
    match parse_i64(&args[1]) {
        Some(delta) => incr_by(db, group, args, delta),
        None => Reply::error("ERR value is not an integer or out of range"),
    }
}

fn exec_decr(db: &Arc<Db>, group: &mut DataGroup<'_>, args: &[Bytes]) -> Reply {
    incr_by(db, group, args, -1)
}

fn exec_decrby(db: &Arc<Db>, group: &mut DataGroup<'_>, args: &[Bytes]) -> Reply {
    match parse_i64(&args[1]).and_then(i64::checked_neg) {
        Some(delta) => incr_by(db, group, args, delta),
        None => Reply::error("ERR value is not an integer or out of range"),
    }
}

fn incr_by(db: &Arc<Db>, group: &mut DataGroup<'_>, args: &[Bytes], delta: i64) -> Reply {
    let key = arg_str(&args[0]);
    db.prune_expired(group, &key);
    if group.contains_key(&key) {
        match group.get_mut(&key) {
            Some(DataEntity::Bytes(data)) => {
                let current = match std::str::from_utf8(data).ok().and_then(|s| s.parse::<i64>().ok()) {
                    Some(n) => n,
                    None => return Reply::error("ERR value is not an integer or out of range"),
                };
                let next = match current.checked_add(delta) {
                    Some(n) => n,
                    None => return Reply::error("ERR increment or decrement would overflow"),
                };
                *data = Bytes::from(next.to_string());
                Reply::integer(next)
            }
            _ => Reply::wrong_type_err(),
        }
    } else {
        db.put_entity(group, &key, DataEntity::Bytes(Bytes::from(delta.to_string())));
        Reply::integer(delta)
    }
}

fn exec_append(db: &Arc<Db>, group: &mut DataGroup<'_>, args: &[Bytes]) -> Reply {
    let key = arg_str(&args[0]);
    db.prune_expired(group, &key);
    if group.contains_key(&key) {
        match group.get_mut(&key) {
            Some(DataEntity::Bytes(data)) => {
                let mut joined = Vec::with_capacity(data.len() + args[1].len());
                joined.extend_from_slice(data);
                joined.extend_from_slice(&args[1]);
                let length = joined.len();
                *data = Bytes::from(joined);
                Reply::integer(length as i64)
            }
            _ => Reply::wrong_type_err(),
        }
    } else {
        let length = args[1].len();
        db.put_entity(group, &key, DataEntity::Bytes(args[1].clone()));
        Reply::integer(length as i64)
    }
}

fn exec_strlen(db: &Arc<Db>, group: &mut DataGroup<'_>, args: &[Bytes]) -> Reply {
    let key = arg_str(&args[0]);
    match db.get_entity(group, &key) {
        Some(DataEntity::Bytes(data)) => Reply::integer(data.len() as i64),
        Some(_) => Reply::wrong_type_err(),
        None => Reply::integer(0),
    }
}

fn exec_mget(db: &Arc<Db>, group: &mut DataGroup<'_>, args: &[Bytes]) -> Reply {
    let values = args
        .iter()
        .map(|arg| match db.get_entity(group, &arg_str(arg)) {
            Some(DataEntity::Bytes(data)) => Reply::Bulk(data.clone()),
            _ => Reply::Null,
        })
        .collect();
    Reply::Raw(values)
}

fn exec_mset(db: &Arc<Db>, group: &mut DataGroup<'_>, args: &[Bytes]) -> Reply {
    if args.len() % 2 != 0 {
        return Reply::arg_num_err("mset");
    }
    for pair in args.chunks_exact(2) {
        let key = arg_str(&pair[0]);
        db.prune_expired(group, &key);
        db.put_entity(group, &key, DataEntity::Bytes(pair[1].clone()));
        db.persist_key(&key);
    }
    Reply::ok()
}
