//! AOF Rewrite
//!
//! Over time the append file accumulates history that no longer matters:
//! overwritten values, deleted keys, expired entries. A rewrite produces a
//! compact equivalent with one command per live key plus its expiration.
//!
//! The procedure runs in three phases so normal writes stay unblocked for
//! all but two short windows:
//!
//! 1. **start** (writers paused): fsync, record the current file size and
//!    selected db, create a temp file next to the live one.
//! 2. **rebuild** (writers flowing): replay exactly the snapshot prefix
//!    into a shadow server, then dump every database as `SELECT i` +
//!    recreate-commands + `PEXPIREAT`s into the temp file.
//! 3. **finish** (writers paused): append everything written after the
//!    snapshot to the temp file, fsync it, and atomically rename it over
//!    the live file.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::sync::Arc;

use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::aof::Persister;
use crate::database::{entity_to_cmd, expire_at_cmd, StandaloneServer};
use crate::protocol::{cmd_line, Reply};

/// Context captured while writers were paused at the start of a rewrite.
pub struct RewriteCtx {
    tmp: NamedTempFile,
    /// Live file size at snapshot time; everything after it is "the tail".
    file_size: u64,
    /// Database the file was "in" at snapshot time.
    db_idx: usize,
}

impl Persister {
    /// Rewrites the append file to a compact snapshot of `server`.
    pub async fn rewrite(&self, server: &Arc<StandaloneServer>) -> std::io::Result<()> {
        let mut ctx = self.start_rewrite()?;
        self.rebuild_snapshot(&mut ctx, server).await?;
        self.finish_rewrite(ctx)
    }

    fn start_rewrite(&self) -> std::io::Result<RewriteCtx> {
        let state = self.state.lock().unwrap();
        let Some(file) = state.file.as_ref() else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "aof file is closed",
            ));
        };
        file.sync_all()?;
        let file_size = file.metadata()?.len();
        let dir = self.filename.parent().unwrap_or_else(|| std::path::Path::new("."));
        let tmp = NamedTempFile::new_in(dir)?;
        debug!(file_size, db = state.current_db, "aof rewrite started");
        Ok(RewriteCtx { tmp, file_size, db_idx: state.current_db })
    }

    async fn rebuild_snapshot(
        &self,
        ctx: &mut RewriteCtx,
        server: &Arc<StandaloneServer>,
    ) -> std::io::Result<()> {
        // Replay the snapshot prefix into a shadow server, then serialize
        // its live state.
        let shadow = server.make_tmp();
        let loader = Persister::detached(&self.filename);
        loader.load(&shadow, ctx.file_size).await;

        let out = ctx.tmp.as_file_mut();
        for index in 0..shadow.databases() {
            out.write_all(&Reply::MultiBulk(cmd_line(&["SELECT", &index.to_string()])).to_bytes())?;
            let mut write_error = None;
            shadow.for_each_entity(index, |key, entity, expire| {
                let mut emit = |line| -> std::io::Result<()> {
                    out.write_all(&Reply::MultiBulk(line).to_bytes())
                };
                let result = entity_to_cmd(key, entity)
                    .map(&mut emit)
                    .unwrap_or(Ok(()))
                    .and_then(|_| match expire {
                        Some(at) => emit(expire_at_cmd(key, at)),
                        None => Ok(()),
                    });
                match result {
                    Ok(()) => true,
                    Err(err) => {
                        write_error = Some(err);
                        false
                    }
                }
            });
            if let Some(err) = write_error {
                shadow.close();
                return Err(err);
            }
        }
        shadow.close();
        Ok(())
    }

    fn finish_rewrite(&self, mut ctx: RewriteCtx) -> std::io::Result<()> {
        let mut state = self.state.lock().unwrap();

        // Commands committed after the snapshot ran against db_idx (or
        // carry their own SELECTs); re-anchor the tail before copying it.
        let mut live = File::open(&self.filename)?;
        live.seek(SeekFrom::Start(ctx.file_size))?;
        let out = ctx.tmp.as_file_mut();
        out.write_all(&Reply::MultiBulk(cmd_line(&["SELECT", &ctx.db_idx.to_string()])).to_bytes())?;
        let tail_bytes = std::io::copy(&mut live, out)?;
        out.sync_all()?;

        // Atomic swap, then reopen the live handle and re-anchor the
        // writer's SELECT bookkeeping in the new file.
        ctx.tmp.persist(&self.filename).map_err(|persist| persist.error)?;
        let mut new_file = OpenOptions::new().create(true).append(true).read(true).open(&self.filename)?;
        new_file
            .write_all(&Reply::MultiBulk(cmd_line(&["SELECT", &state.current_db.to_string()])).to_bytes())?;
        state.file = Some(new_file);

        info!(tail_bytes, file = %self.filename.display(), "aof rewrite swapped in");
        Ok(())
    }
}
