//! The sync-function evaluator.
//!
//! Every document write runs a user-supplied JavaScript function
//! `function(doc, oldDoc, userCtx)` that maps the new body to channel
//! membership, per-user access grants, role grants, an optional expiry, and
//! an optional rejection. V8 isolates are single-threaded, so the
//! [`ChannelMapper`] keeps a pool of dedicated worker threads, each owning
//! one [`JsRuntime`] with the compiled function; callers rendezvous with the
//! pool over a zero-capacity channel and block while every instance is busy.
//!
//! The host/guest boundary passes plain JSON values in both directions. The
//! script never sees host-owned structures, and results come back through op
//! state, collected per call.

use std::cell::RefCell;
use std::rc::Rc;

use deno_core::error::AnyError;
use deno_core::{op2, JsRuntime, OpState, RuntimeOptions};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::oneshot;
use tracing::{error_span, trace, warn};

use penstock_base::{Error, Result};

use crate::{set_from_array, AccessMap, ChannelSet, StarMode};

/// The mapper used when a database is configured without a sync function.
pub const DEFAULT_SYNC_FUNCTION: &str = "function(doc){channel(doc.channels);}";

/// Role grants emitted by the script carry this prefix on the wire; it is
/// stripped before storage.
const ROLE_PREFIX: &str = "role:";

/// The identity of the requesting user, as seen by the script. `None` stands
/// for the admin context, in which the `require*` intrinsics are no-ops.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UserCtx {
    pub name: Option<String>,
    pub channels: Vec<String>,
    pub roles: Vec<String>,
}

/// Everything one sync-function run produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncFnResult {
    pub channels: ChannelSet,
    pub access: AccessMap,
    pub roles: AccessMap,
    pub expiry: Option<u32>,
    pub rejection: Option<Error>,
}

struct Job {
    doc: Value,
    old_doc: Value,
    user: Value,
    reply: oneshot::Sender<Result<SyncFnResult>>,
}

struct Pool {
    tx: flume::Sender<Job>,
    source: String,
}

/// Pool of single-threaded sync-function evaluator instances.
pub struct ChannelMapper {
    pool: RwLock<Pool>,
    pool_size: usize,
}

impl ChannelMapper {
    /// Compiles `source` on `pool_size` worker threads. A compile error
    /// tears the half-built pool down and is returned to the caller.
    pub fn new(source: impl Into<String>, pool_size: usize) -> Result<Self> {
        let pool = Pool::spawn(source.into(), pool_size.max(1))?;
        Ok(ChannelMapper {
            pool: RwLock::new(pool),
            pool_size: pool_size.max(1),
        })
    }

    pub fn new_default(pool_size: usize) -> Result<Self> {
        Self::new(DEFAULT_SYNC_FUNCTION, pool_size)
    }

    /// The currently active function source.
    pub fn function(&self) -> String {
        self.pool.read().source.clone()
    }

    /// Replaces the sync function, swapping in a freshly compiled pool.
    ///
    /// Returns false if `source` equals the active function. On a compile
    /// error the old pool stays active and the error surfaces to the caller.
    pub fn set_function(&self, source: impl Into<String>) -> Result<bool> {
        let source = source.into();
        if self.pool.read().source == source {
            return Ok(false);
        }
        let fresh = Pool::spawn(source, self.pool_size)?;
        // Dropping the old sender lets in-flight workers drain and exit.
        *self.pool.write() = fresh;
        Ok(true)
    }

    /// Runs the sync function over `doc`, blocking while all evaluator
    /// instances are busy.
    pub async fn map_to_channels_and_access(
        &self,
        doc: Map<String, Value>,
        old_doc: Option<Map<String, Value>>,
        user: Option<UserCtx>,
    ) -> Result<SyncFnResult> {
        let tx = self.pool.read().tx.clone();
        let (reply, rx) = oneshot::channel();
        let job = Job {
            doc: Value::Object(doc),
            old_doc: old_doc.map(Value::Object).unwrap_or(Value::Null),
            user: match user {
                Some(user) => serde_json::to_value(&user)?,
                None => Value::Null,
            },
            reply,
        };
        tx.send_async(job)
            .await
            .map_err(|_| Error::Internal("sync function pool is gone".into()))?;
        rx.await
            .map_err(|_| Error::Internal("sync function evaluator died".into()))?
    }
}

impl std::fmt::Debug for ChannelMapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelMapper")
            .field("pool_size", &self.pool_size)
            .finish_non_exhaustive()
    }
}

impl Pool {
    fn spawn(source: String, pool_size: usize) -> Result<Pool> {
        // Zero capacity: a send completes only when a worker is free.
        let (tx, rx) = flume::bounded::<Job>(0);
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        for worker in 0..pool_size {
            let source = source.clone();
            let rx = rx.clone();
            let ready_tx = ready_tx.clone();
            std::thread::spawn(move || {
                let span = error_span!("sync_fn", worker);
                let _enter = span.enter();
                let mut evaluator = match Evaluator::new(&source) {
                    Ok(evaluator) => {
                        ready_tx.send(Ok(())).ok();
                        evaluator
                    }
                    Err(err) => {
                        ready_tx.send(Err(format!("{err:#}"))).ok();
                        return;
                    }
                };
                while let Ok(job) = rx.recv() {
                    trace!("evaluating sync function");
                    let result = evaluator.call(job.doc, job.old_doc, job.user);
                    job.reply.send(result).ok();
                }
                trace!("evaluator shutting down");
            });
        }
        drop(ready_tx);
        for _ in 0..pool_size {
            match ready_rx.recv() {
                Ok(Ok(())) => {}
                Ok(Err(message)) => {
                    return Err(Error::bad_request(format!(
                        "error compiling sync function: {message}"
                    )))
                }
                Err(_) => return Err(Error::Internal("evaluator worker vanished".into())),
            }
        }
        Ok(Pool { tx, source })
    }
}

/// Per-call collection state the ops write into.
#[derive(Default)]
struct Collector {
    channels: ChannelSet,
    access: AccessMap,
    roles: AccessMap,
    expiry: Option<u32>,
    rejection: Option<Error>,
}

impl Collector {
    fn into_result(self) -> SyncFnResult {
        SyncFnResult {
            channels: self.channels,
            access: self.access,
            roles: self.roles,
            expiry: self.expiry,
            rejection: self.rejection,
        }
    }
}

/// The call arguments, parked in op state for `op_sync_args` to pick up.
struct CallArgs(Value);

deno_core::extension!(
    penstock_sync_fn,
    ops = [
        op_sync_args,
        op_channel,
        op_access,
        op_role,
        op_reject,
        op_expiry
    ],
);

/// One JsRuntime with the compiled user function. Lives on exactly one
/// thread for its whole life.
struct Evaluator {
    runtime: JsRuntime,
}

impl Evaluator {
    fn new(source: &str) -> anyhow::Result<Self> {
        let mut runtime = JsRuntime::new(RuntimeOptions {
            extensions: vec![penstock_sync_fn::init_ops()],
            ..Default::default()
        });
        runtime.execute_script("penstock:prelude", PRELUDE.to_string().into())?;
        let compile = format!("globalThis.__syncFn = ({source});\n__checkSyncFn();");
        runtime.execute_script("penstock:sync_fn", compile.into())?;
        Ok(Evaluator { runtime })
    }

    fn call(&mut self, doc: Value, old_doc: Value, user: Value) -> Result<SyncFnResult> {
        let state = self.runtime.op_state();
        {
            let mut state = state.borrow_mut();
            state.put(Collector::default());
            state.put(CallArgs(serde_json::json!({
                "doc": doc,
                "oldDoc": old_doc,
                "userCtx": user,
            })));
        }
        let outcome = self
            .runtime
            .execute_script("penstock:call", CALL.to_string().into());
        let collector = collect(&state);
        match outcome {
            Ok(_) => Ok(collector.into_result()),
            Err(err) => {
                // Script stack goes to the log; the caller sees a plain 500.
                warn!("sync function threw: {err:#}");
                Err(Error::Internal("sync function error".into()))
            }
        }
    }
}

fn collect(state: &Rc<RefCell<OpState>>) -> Collector {
    let mut state = state.borrow_mut();
    state.try_take::<CallArgs>();
    state.try_take::<Collector>().unwrap_or_default()
}

/// Normalizes a scalar-or-array-or-nested-array argument to strings,
/// silently dropping nulls and non-strings.
fn coerce_strings(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) => out.push(s.clone()),
        Value::Array(items) => {
            for item in items {
                coerce_strings(item, out);
            }
        }
        _ => {}
    }
}

fn strings_of(value: &Value) -> Vec<String> {
    let mut out = Vec::new();
    coerce_strings(value, &mut out);
    out
}

#[op2]
#[serde]
fn op_sync_args(state: &mut OpState) -> std::result::Result<serde_json::Value, AnyError> {
    let args = state
        .try_take::<CallArgs>()
        .ok_or_else(|| anyhow::anyhow!("no sync function call in progress"))?;
    Ok(args.0)
}

#[op2]
fn op_channel(
    state: &mut OpState,
    #[serde] names: serde_json::Value,
) -> std::result::Result<(), AnyError> {
    let names = strings_of(&names);
    // A document cannot be a member of the wildcard; drop it silently.
    let channels = set_from_array(&names, StarMode::Remove)
        .map_err(|err| anyhow::anyhow!("{err}"))?;
    let collector = state.borrow_mut::<Collector>();
    collector.channels.extend(channels);
    Ok(())
}

fn grant(
    map: &mut AccessMap,
    users: &Value,
    channels: ChannelSet,
) {
    if channels.is_empty() {
        return;
    }
    for user in strings_of(users) {
        map.entry(user).or_default().extend(channels.iter().cloned());
    }
}

#[op2]
fn op_access(
    state: &mut OpState,
    #[serde] users: serde_json::Value,
    #[serde] channels: serde_json::Value,
) -> std::result::Result<(), AnyError> {
    // Granting "*" makes the user see every channel, so the wildcard is a
    // legal grant here.
    let channels = set_from_array(&strings_of(&channels), StarMode::Keep)
        .map_err(|err| anyhow::anyhow!("{err}"))?;
    let collector = state.borrow_mut::<Collector>();
    grant(&mut collector.access, &users, channels);
    Ok(())
}

#[op2]
fn op_role(
    state: &mut OpState,
    #[serde] users: serde_json::Value,
    #[serde] roles: serde_json::Value,
) -> std::result::Result<(), AnyError> {
    let mut stripped = ChannelSet::new();
    for role in strings_of(&roles) {
        let name = role
            .strip_prefix(ROLE_PREFIX)
            .ok_or_else(|| anyhow::anyhow!("role name {role:?} must be prefixed with \"role:\""))?;
        if name.is_empty() {
            return Err(anyhow::anyhow!("empty role name"));
        }
        stripped.insert(name.to_string());
    }
    let collector = state.borrow_mut::<Collector>();
    grant(&mut collector.roles, &users, stripped);
    Ok(())
}

#[op2(fast)]
fn op_reject(state: &mut OpState, status: u32, #[string] message: String) {
    let collector = state.borrow_mut::<Collector>();
    if collector.rejection.is_none() {
        collector.rejection = Some(Error::http(status as u16, message));
    }
}

#[op2]
fn op_expiry(state: &mut OpState, #[serde] value: serde_json::Value) {
    if value.is_null() {
        return;
    }
    match validate_expiry(&value) {
        Some(expiry) => {
            let collector = state.borrow_mut::<Collector>();
            collector.expiry = Some(expiry);
        }
        None => warn!("invalid expiry value {value}, ignoring"),
    }
}

/// Validates an expiry value from the script: a non-negative number within
/// u32 range, a numeric string, or an ISO-8601 date string. Anything else is
/// invalid and leaves expiry unset.
pub fn validate_expiry(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => {
            let n = n.as_f64()?;
            if n < 0.0 || n > u32::MAX as f64 {
                return None;
            }
            Some(n as u32)
        }
        Value::String(s) => {
            if let Ok(n) = s.parse::<i64>() {
                return u32::try_from(n).ok();
            }
            let date = chrono::DateTime::parse_from_rfc3339(s).ok()?;
            u32::try_from(date.timestamp()).ok()
        }
        _ => None,
    }
}

/// Installed once per runtime: the host intrinsics.
const PRELUDE: &str = r#"
(() => {
    const ops = Deno.core.ops;
    globalThis.channel = function (...names) {
        ops.op_channel(names);
    };
    globalThis.access = function (users, channels) {
        ops.op_access(users ?? null, channels ?? null);
    };
    globalThis.role = function (users, roles) {
        ops.op_role(users ?? null, roles ?? null);
    };
    globalThis.reject = function (status, message) {
        ops.op_reject(status >>> 0, String(message ?? ""));
    };
    globalThis.expiry = function (value) {
        ops.op_expiry(value === undefined ? null : value);
    };
    globalThis.__checkSyncFn = function () {
        if (typeof globalThis.__syncFn !== "function") {
            throw new Error("sync function is not a function");
        }
    };
})();
"#;

/// Executed per call: binds the user-context-dependent intrinsics, invokes
/// the function, and translates `throw({forbidden: ...})` into a rejection.
const CALL: &str = r#"
(() => {
    const ops = Deno.core.ops;
    const args = ops.op_sync_args();
    const doc = args.doc;
    const oldDoc = args.oldDoc;
    const userCtx = args.userCtx;
    const shouldValidate = userCtx !== null && userCtx.name !== null;
    const toArray = (v) =>
        v === null || v === undefined ? [] : Array.isArray(v) ? v : [v];

    globalThis.requireUser = function (names) {
        if (!shouldValidate) return;
        if (toArray(names).indexOf(userCtx.name) < 0) {
            throw { forbidden: "wrong user" };
        }
    };
    globalThis.requireRole = function (roles) {
        if (!shouldValidate) return;
        const held = userCtx.roles ?? [];
        for (const role of toArray(roles)) {
            if (Array.isArray(held) ? held.indexOf(role) >= 0
                                    : Object.prototype.hasOwnProperty.call(held, role)) {
                return;
            }
        }
        throw { forbidden: "missing role" };
    };
    globalThis.requireAccess = function (channels) {
        if (!shouldValidate) return;
        const held = userCtx.channels ?? [];
        for (const channel of toArray(channels)) {
            if (held.indexOf(channel) >= 0) return;
        }
        throw { forbidden: "missing channel access" };
    };

    try {
        globalThis.__syncFn(doc, oldDoc, userCtx);
    } catch (err) {
        if (err && typeof err === "object" && err.forbidden !== undefined) {
            ops.op_reject(403, String(err.forbidden));
        } else if (err && typeof err === "object" && err.unauthorized !== undefined) {
            ops.op_reject(401, String(err.unauthorized));
        } else {
            throw err;
        }
    }
})();
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::set_of;

    fn parse(json: &str) -> Map<String, Value> {
        serde_json::from_str(json).unwrap()
    }

    fn no_user() -> Option<UserCtx> {
        Some(UserCtx {
            name: None,
            channels: vec![],
            roles: vec![],
        })
    }

    async fn run(source: &str, doc: &str) -> Result<SyncFnResult> {
        let mapper = ChannelMapper::new(source, 1)?;
        mapper
            .map_to_channels_and_access(parse(doc), None, no_user())
            .await
    }

    #[tokio::test]
    async fn channel_calls_collect() {
        let res = run(
            r#"function(doc) {channel("foo", "bar"); channel("baz")}"#,
            r#"{"channels": []}"#,
        )
        .await
        .unwrap();
        assert_eq!(res.channels, set_of(&["foo", "bar", "baz"]).unwrap());
    }

    #[tokio::test]
    async fn channel_takes_arrays_and_input() {
        let res = run(
            r#"function(doc) {channel(doc.x.concat(doc.y));}"#,
            r#"{"x":["abc"],"y":["xyz"]}"#,
        )
        .await
        .unwrap();
        assert_eq!(res.channels, set_of(&["abc", "xyz"]).unwrap());

        let res = run(
            r#"function(doc) {channel(["foo", "bar ok","baz"])}"#,
            r#"{}"#,
        )
        .await
        .unwrap();
        assert_eq!(res.channels, set_of(&["foo", "bar ok", "baz"]).unwrap());
    }

    #[tokio::test]
    async fn invalid_channel_name_is_an_error() {
        let err = run(
            r#"function(doc) {channel(["foo", "bad,name","baz"])}"#,
            r#"{}"#,
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), 500);

        let err = run(r#"function(doc) {access("foo", "bad,name");}"#, r#"{}"#)
            .await
            .unwrap_err();
        assert_eq!(err.status(), 500);
    }

    #[tokio::test]
    async fn access_grants() {
        let res = run(
            r#"function(doc) {access("foo", "bar"); access("foo", "baz")}"#,
            r#"{}"#,
        )
        .await
        .unwrap();
        let expected: AccessMap =
            [("foo".to_string(), set_of(&["bar", "baz"]).unwrap())].into();
        assert_eq!(res.access, expected);

        let res = run(
            r#"function(doc) {access(["foo","bar","baz"], "ginger")}"#,
            r#"{}"#,
        )
        .await
        .unwrap();
        assert_eq!(res.access.len(), 3);
        assert_eq!(res.access["bar"], set_of(&["ginger"]).unwrap());
    }

    #[tokio::test]
    async fn access_tolerates_nulls_and_non_strings() {
        for source in [
            r#"function(doc) {access([], ["a", "b"])}"#,
            r#"function(doc) {access("lee", [])}"#,
            r#"function(doc) {access(null, ["a"])}"#,
            r#"function(doc) {access("lee", null)}"#,
            r#"function(doc) {var x = {}; access(x.nothing, ["a"])}"#,
        ] {
            let res = run(source, r#"{}"#).await.unwrap();
            assert!(res.access.is_empty(), "for {source}");
        }

        let res = run(
            r#"function(doc) {access("lee", ["ginger", null, 5])}"#,
            r#"{}"#,
        )
        .await
        .unwrap();
        assert_eq!(res.access["lee"], set_of(&["ginger"]).unwrap());
    }

    #[tokio::test]
    async fn role_grants_strip_prefix() {
        let res = run(
            r#"function(doc) {role(["foo","bar"], "role:froods")}"#,
            r#"{}"#,
        )
        .await
        .unwrap();
        assert_eq!(res.roles["foo"], set_of(&["froods"]).unwrap());
        assert_eq!(res.roles["bar"], set_of(&["froods"]).unwrap());

        let err = run(r#"function(doc) {role("foo", "froods")}"#, r#"{}"#)
            .await
            .unwrap_err();
        assert_eq!(err.status(), 500);
    }

    #[tokio::test]
    async fn reject_and_throw() {
        let res = run(r#"function(doc) {reject(403, "bad");}"#, r#"{}"#)
            .await
            .unwrap();
        assert_eq!(res.rejection, Some(Error::http(403, "bad")));

        let res = run(r#"function(doc) {throw({forbidden:"bad"});}"#, r#"{}"#)
            .await
            .unwrap();
        assert_eq!(res.rejection, Some(Error::http(403, "bad")));
    }

    #[tokio::test]
    async fn runtime_exception_is_internal() {
        let err = run(r#"function(doc) {(null)[5];}"#, r#"{}"#)
            .await
            .unwrap_err();
        assert_eq!(err.status(), 500);
    }

    #[tokio::test]
    async fn compile_error_reported() {
        assert!(ChannelMapper::new("function(doc) {", 1).is_err());
        assert!(ChannelMapper::new("42", 1).is_err());
    }

    #[tokio::test]
    async fn default_and_empty_mappers() {
        let mapper = ChannelMapper::new_default(1).unwrap();
        let res = mapper
            .map_to_channels_and_access(
                parse(r#"{"channels": ["foo", "bar", "baz"]}"#),
                None,
                no_user(),
            )
            .await
            .unwrap();
        assert_eq!(res.channels, set_of(&["foo", "bar", "baz"]).unwrap());

        let res = mapper
            .map_to_channels_and_access(parse(r#"{"x": "y"}"#), None, no_user())
            .await
            .unwrap();
        assert!(res.channels.is_empty());

        let res = run(r#"function(doc) {}"#, r#"{"channels": ["foo"]}"#)
            .await
            .unwrap();
        assert!(res.channels.is_empty());
    }

    #[tokio::test]
    async fn require_user() {
        let mapper =
            ChannelMapper::new(r#"function(doc, oldDoc) {requireUser(doc.owner);}"#, 1).unwrap();
        let sally = UserCtx {
            name: Some("sally".into()),
            ..Default::default()
        };
        let res = mapper
            .map_to_channels_and_access(parse(r#"{"owner": "sally"}"#), None, Some(sally))
            .await
            .unwrap();
        assert_eq!(res.rejection, None);

        let linus = UserCtx {
            name: Some("linus".into()),
            ..Default::default()
        };
        let res = mapper
            .map_to_channels_and_access(parse(r#"{"owner": "sally"}"#), None, Some(linus))
            .await
            .unwrap();
        assert_eq!(res.rejection, Some(Error::http(403, "wrong user")));

        // Admin context skips validation entirely.
        let res = mapper
            .map_to_channels_and_access(parse(r#"{"owner": "sally"}"#), None, None)
            .await
            .unwrap();
        assert_eq!(res.rejection, None);
    }

    #[tokio::test]
    async fn require_role_and_access() {
        let mapper =
            ChannelMapper::new(r#"function(doc, oldDoc) {requireRole(doc.roles);}"#, 1).unwrap();
        let sally = UserCtx {
            name: Some("sally".into()),
            roles: vec!["girl".into(), "5yo".into()],
            ..Default::default()
        };
        let res = mapper
            .map_to_channels_and_access(parse(r#"{"roles": ["kid","girl"]}"#), None, Some(sally))
            .await
            .unwrap();
        assert_eq!(res.rejection, None);

        let linus = UserCtx {
            name: Some("linus".into()),
            roles: vec!["boy".into()],
            ..Default::default()
        };
        let res = mapper
            .map_to_channels_and_access(parse(r#"{"roles": ["girl"]}"#), None, Some(linus))
            .await
            .unwrap();
        assert_eq!(res.rejection, Some(Error::http(403, "missing role")));

        let mapper =
            ChannelMapper::new(r#"function(doc, oldDoc) {requireAccess(doc.channel)}"#, 1)
                .unwrap();
        let sally = UserCtx {
            name: Some("sally".into()),
            channels: vec!["party".into(), "school".into()],
            ..Default::default()
        };
        let res = mapper
            .map_to_channels_and_access(parse(r#"{"channel": "party"}"#), None, Some(sally.clone()))
            .await
            .unwrap();
        assert_eq!(res.rejection, None);

        let res = mapper
            .map_to_channels_and_access(parse(r#"{"channel": "work"}"#), None, Some(sally))
            .await
            .unwrap();
        assert_eq!(
            res.rejection,
            Some(Error::http(403, "missing channel access"))
        );
    }

    #[tokio::test]
    async fn expiry_matrix() {
        let mapper =
            ChannelMapper::new(r#"function(doc) {expiry(doc.expiry);}"#, 1).unwrap();
        let cases: [(&str, Option<u32>); 7] = [
            (r#"{"expiry":100}"#, Some(100)),
            (r#"{"expiry":"500"}"#, Some(500)),
            (
                r#"{"expiry":"2105-01-01T00:00:00.000+00:00"}"#,
                Some(4260211200),
            ),
            (r#"{"expiry":"abc"}"#, None),
            (r#"{"expiry":["100", "200"]}"#, None),
            (r#"{"expiry":-100}"#, None),
            (r#"{"expiry":123456789012345}"#, None),
        ];
        for (doc, expected) in cases {
            let res = mapper
                .map_to_channels_and_access(parse(doc), None, no_user())
                .await
                .unwrap();
            assert_eq!(res.expiry, expected, "for {doc}");
        }

        // Unspecified expiry stays unset.
        let res = mapper
            .map_to_channels_and_access(parse(r#"{"value":5}"#), None, no_user())
            .await
            .unwrap();
        assert_eq!(res.expiry, None);
    }

    #[tokio::test]
    async fn later_invalid_expiry_keeps_earlier_value() {
        let mapper = ChannelMapper::new(
            r#"function(doc) {expiry(doc.expiry); expiry(doc.secondExpiry)}"#,
            1,
        )
        .unwrap();
        let res = mapper
            .map_to_channels_and_access(parse(r#"{"expiry":100}"#), None, no_user())
            .await
            .unwrap();
        assert_eq!(res.expiry, Some(100));
    }

    #[tokio::test]
    async fn set_function_swaps_pool() {
        let mapper =
            ChannelMapper::new(r#"function(doc) {channel(doc.channels);}"#, 1).unwrap();
        let changed = mapper
            .set_function(r#"function(doc) {channel("all");}"#)
            .unwrap();
        assert!(changed);
        let res = mapper
            .map_to_channels_and_access(parse(r#"{"channels": ["foo"]}"#), None, no_user())
            .await
            .unwrap();
        assert_eq!(res.channels, set_of(&["all"]).unwrap());

        // Unchanged source is a no-op.
        assert!(!mapper
            .set_function(r#"function(doc) {channel("all");}"#)
            .unwrap());

        // A bad replacement leaves the old function active.
        assert!(mapper.set_function("function(doc) {").is_err());
        let res = mapper
            .map_to_channels_and_access(parse(r#"{}"#), None, no_user())
            .await
            .unwrap();
        assert_eq!(res.channels, set_of(&["all"]).unwrap());
    }

    #[test]
    fn expiry_validation_boundaries() {
        assert_eq!(validate_expiry(&serde_json::json!(0)), Some(0));
        assert_eq!(
            validate_expiry(&serde_json::json!(u32::MAX as u64)),
            Some(u32::MAX)
        );
        assert_eq!(validate_expiry(&serde_json::json!(u32::MAX as u64 + 1)), None);
        assert_eq!(validate_expiry(&serde_json::json!(-1)), None);
        assert_eq!(
            validate_expiry(&serde_json::json!("1805-01-01T00:00:00.000+00:00")),
            None
        );
        assert_eq!(validate_expiry(&serde_json::json!({"a": 1})), None);
    }
}
