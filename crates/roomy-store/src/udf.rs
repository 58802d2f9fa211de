//! Built-in user-defined SQL functions.
//!
//! Registered on every connection at open:
//!
//! - `text(blob)` - blob → utf8 (lossy)
//! - `is_ulid(s)` - 1 when `s` is a canonical 26-char ulid
//! - `ulid_timestamp(s)` - millisecond timestamp of a ulid, NULL if invalid
//! - `timestamp_to_ulid(ms)` - zero-random ulid for range scans
//! - `apply_dmp_patch(text, patch)` - Diff-Match-Patch application

use std::str::FromStr as _;

use rusqlite::Connection;
use rusqlite::functions::{Context, FunctionFlags};
use rusqlite::types::Value as SqliteValue;
use ulid::Ulid;

use crate::dmp;
use crate::value::SqlValue;

fn flags() -> FunctionFlags {
    FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC
}

fn user_error(err: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::UserFunctionError(Box::new(err))
}

pub(crate) fn register_builtin(conn: &Connection) -> rusqlite::Result<()> {
    conn.create_scalar_function("text", 1, flags(), |ctx| {
        Ok(match ctx.get::<SqliteValue>(0)? {
            SqliteValue::Blob(bytes) => {
                SqliteValue::Text(String::from_utf8_lossy(&bytes).into_owned())
            }
            SqliteValue::Text(text) => SqliteValue::Text(text),
            SqliteValue::Null => SqliteValue::Null,
            other => SqliteValue::Text(format!("{other:?}")),
        })
    })?;

    conn.create_scalar_function("is_ulid", 1, flags(), |ctx| {
        let candidate = ctx.get::<String>(0)?;
        Ok(i64::from(
            candidate.len() == 26 && Ulid::from_str(&candidate).is_ok(),
        ))
    })?;

    conn.create_scalar_function("ulid_timestamp", 1, flags(), |ctx| {
        let candidate = ctx.get::<String>(0)?;
        Ok(match Ulid::from_str(&candidate) {
            Ok(ulid) => SqliteValue::Integer(
                i64::try_from(ulid.timestamp_ms()).map_err(user_error)?,
            ),
            Err(_) => SqliteValue::Null,
        })
    })?;

    conn.create_scalar_function("timestamp_to_ulid", 1, flags(), |ctx| {
        let millis = ctx.get::<i64>(0)?;
        let millis = u64::try_from(millis).map_err(user_error)?;
        Ok(Ulid::from_parts(millis, 0).to_string())
    })?;

    conn.create_scalar_function("apply_dmp_patch", 2, flags(), |ctx| {
        let current = ctx.get::<String>(0)?;
        let patch = ctx.get::<String>(1)?;
        dmp::apply(&patch, &current).map_err(user_error)
    })?;

    Ok(())
}

/// Register a caller-provided scalar UDF.
pub(crate) fn register_custom(
    conn: &Connection,
    name: &str,
    arity: usize,
    f: impl Fn(&[SqlValue]) -> Result<SqlValue, roomy_util::BoxedError>
    + Send
    + Sync
    + std::panic::UnwindSafe
    + 'static,
) -> rusqlite::Result<()> {
    let arity_i32 = i32::try_from(arity).expect("Arity overflow");
    conn.create_scalar_function(name, arity_i32, flags(), move |ctx: &Context<'_>| {
        let mut args = Vec::with_capacity(arity);
        for at in 0..arity {
            args.push(SqlValue::from(ctx.get::<SqliteValue>(at)?));
        }
        f(&args).map_err(rusqlite::Error::UserFunctionError)
    })
}
