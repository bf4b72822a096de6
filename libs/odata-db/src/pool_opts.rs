//! sqlx pool settings derived from [`ConnectOpts`].

use sea_orm::sqlx::{Database, pool::PoolOptions};

use crate::ConnectOpts;

/// Pool options for any sqlx driver; unset knobs keep sqlx defaults.
pub(crate) fn pool_options<DB: Database>(opts: &ConnectOpts) -> PoolOptions<DB> {
    let mut pool = PoolOptions::<DB>::new();
    if let Some(n) = opts.max_conns {
        pool = pool.max_connections(n);
    }
    if let Some(n) = opts.min_conns {
        pool = pool.min_connections(n);
    }
    if let Some(t) = opts.acquire_timeout {
        pool = pool.acquire_timeout(t);
    }
    if let Some(t) = opts.idle_timeout {
        pool = pool.idle_timeout(t);
    }
    pool
}
