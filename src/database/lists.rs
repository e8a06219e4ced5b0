//! List Commands
//!
//! A compact list family over the `DataEntity::List` tag: pushes, pops,
//! length and range readout. Enough surface for the type union and the
//! WRONGTYPE contract to be real.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;

use crate::database::db::{DataGroup, Db};
use crate::database::entity::DataEntity;
use crate::database::registry::{
    read_first_key, undo_first_key, write_first_key, CommandExtra, CommandTable, FLAG_READONLY,
    FLAG_WRITE,
};
use crate::database::{arg_str, parse_i64};
use crate::protocol::Reply;

pub fn register(table: &mut CommandTable) {
    table.register(
        "lpush",
        -3,
        FLAG_WRITE,
        write_first_key,
        exec_lpush,
        Some(undo_first_key),
        Some(CommandExtra { signs: &["write", "denyoom", "fast"], first_key: 1, last_key: 1, key_step: 1 }),
    );
    table.register(
        "rpush",
        -3,
        FLAG_WRITE,
        write_first_key,
        exec_rpush,
        Some(undo_first_key),
        Some(CommandExtra { signs: &["write", "denyoom", "fast"], first_key: 1, last_key: 1, key_step: 1 }),
    );
    table.register(
        "lpop",
        2,
        FLAG_WRITE,
        write_first_key,
        exec_lpop,
        Some(undo_first_key),
        Some(CommandExtra { signs: &["write", "fast"], first_key: 1, last_key: 1, key_step: 1 }),
    );
    table.register(
        "rpop",
        2,
        FLAG_WRITE,
        write_first_key,
        exec_rpop,
        Some(undo_first_key),
        Some(CommandExtra { signs: &["write", "fast"], first_key: 1, last_key: 1, key_step: 1 }),
    );
    table.register(
        "llen",
        2,
        FLAG_READONLY,
        read_first_key,
        exec_llen,
        None,
        Some(CommandExtra { signs: &["readonly", "fast"], first_key: 1, last_key: 1, key_step: 1 }),
    );
    table.register(
        "lrange",
        4,
        FLAG_READONLY,
        read_first_key,
        exec_lrange,
        None,
        Some(CommandExtra { signs: &["readonly"], first_key: 1, last_key: 1, key_step: 1 }),
    );
}

fn exec_lpush(db: &Arc<Db>, group: &mut DataGroup<'_>, args: &[Bytes]) -> Reply {
    push(db, group, args, true)
}

fn exec_rpush(db: &Arc<Db>, group: &mut DataGroup<'_>, args: &[Bytes]) -> Reply {
    push(db, group, args, false)
}

fn push(db: &Arc<Db>, group: &mut DataGroup<'_>, args: &[Bytes], front: bool) -> Reply {
    let key = arg_str(&args[0]);
    db.prune_expired(group, &key);
    if group.contains_key(&key) {
        match group.get_mut(&key) {
            Some(DataEntity::List(items)) => {
                for value in &args[1..] {
                    if front {
                        items.push_front(value.clone());
                    } else {
                        items.push_back(value.clone());
                    }
                }
                Reply::integer(items.len() as i64)
            }
            _ => Reply::wrong_type_err(),
        }
    } else {
        let mut items = VecDeque::with_capacity(args.len() - 1);
        for value in &args[1..] {
            if front {
                items.push_front(value.clone());
            } else {
                items.push_back(value.clone());
            }
        }
        let length = items.len();
        db.put_entity(group, &key, DataEntity::List(items));
        Reply::integer(length as i64)
    }
}

fn exec_lpop(db: &Arc<Db>, group: &mut DataGroup<'_>, args: &[Bytes]) -> Reply {
    pop(db, group, args, true)
}

fn exec_rpop(db: &Arc<Db>, group: &mut DataGroup<'_>, args: &[Bytes]) -> Reply {
    pop(db, group, args, false)
}

fn pop(db: &Arc<Db>, group: &mut DataGroup<'_>, args: &[Bytes], front: bool) -> Reply {
    let key = arg_str(&args[0]);
    db.prune_expired(group, &key);
    if !group.contains_key(&key) {
        return Reply::Null;
    }
    let (popped, now_empty) = match group.get_mut(&key) {
        Some(DataEntity::List(items)) => {
            let value = if front { items.pop_front() } else { items.pop_back() };
            (value, items.is_empty())
        }
        _ => return Reply::wrong_type_err(),
    };
    if now_empty {
        // Empty lists do not linger as keys.
        db.remove_entity(group, &key);
    }
    match popped {
        Some(value) => Reply::Bulk(value),
        None => Reply::Null,
    }
}

fn exec_llen(db: &Arc<Db>, group: &mut DataGroup<'_>, args: &[Bytes]) -> Reply {
    let key = arg_str(&args[0]);
    match db.get_entity(group, &key) {
        Some(DataEntity::List(items)) => Reply::integer(items.len() as i64),
        Some(_) => Reply::wrong_type_err(),
        None => Reply::integer(0),
    }
}

fn exec_lrange(db: &Arc<Db>, group: &mut DataGroup<'_>, args: &[Bytes]) -> Reply {
    let key = arg_str(&args[0]);
    let (Some(start), Some(stop)) = (parse_i64(&args[1]), parse_i64(&args[2])) else {
        return Reply::error("ERR value is not an integer or out of range");
    };
    match db.get_entity(group, &key) {
        Some(DataEntity::List(items)) => {
            let len = items.len() as i64;
            let mut start = if start < 0 { len + start } else { start };
            let mut stop = if stop < 0 { len + stop } else { stop };
            start = start.max(0);
            stop = stop.min(len - 1);
            if start > stop || start >= len {
                return Reply::empty_multi_bulk();
            }
            let slice = items
                .iter()
                .skip(start as usize)
                .take((stop - start + 1) as usize)
                .cloned()
                .collect();
            Reply::MultiBulk(slice)
        }
        Some(_) => Reply::wrong_type_err(),
        None => Reply::empty_multi_bulk(),
    }
}
