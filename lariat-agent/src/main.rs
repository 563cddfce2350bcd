//! Stock lariat agent binary.
//!
//! Ships the built-in host-fact operations so a freshly provisioned
//! host can answer useful questions with nothing else installed.
#![allow(clippy::print_stderr)]

#[cfg(not(unix))]
fn main() {
    eprintln!("lariat-agent requires a Unix host");
    std::process::exit(1);
}

#[cfg(unix)]
fn main() -> std::io::Result<()> {
    agent::run()
}

#[cfg(unix)]
mod agent {
    use std::io;
    use std::sync::Arc;
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    use lariat::{Launch, Tunnel};
    use lariat_agent::{CallArgs, OpCtx, OpResult, Registry, claim_stdio, serve};
    use lariat_proto::Value;

    /// Entry point: claim stdio, then serve the controller until EOF.
    pub(crate) fn run() -> io::Result<()> {
        let transport = claim_stdio()?;
        let registry = Arc::new(builtin_registry());
        tokio::runtime::Runtime::new()?.block_on(serve(
            tokio::fs::File::from_std(transport.input),
            tokio::fs::File::from_std(transport.output),
            registry,
        ))
    }

    /// The stock operation set.
    fn builtin_registry() -> Registry {
        let mut registry = Registry::new();
        registry.register("echo", echo);
        registry.register("time", time);
        registry.register("hostname", hostname);
        registry.register("ip", ip);
        registry.register("sleep_ms", sleep_ms);
        registry.register("read_resource", read_resource);
        registry.register("resource_cached", resource_cached);
        registry.register_async("nest_call", nest_call);
        registry
    }

    /// Returns the first argument unchanged (all of them, if several).
    fn echo(_ctx: &OpCtx, args: CallArgs) -> OpResult {
        Ok(match args.args.len() {
            0 => Value::Null,
            1 => args.args.into_iter().next().unwrap_or(Value::Null),
            _ => Value::List(args.args),
        })
    }

    /// Seconds since the Unix epoch, as a float.
    fn time(_ctx: &OpCtx, _args: CallArgs) -> OpResult {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| Value::Float(d.as_secs_f64()))
            .map_err(|e| format!("clock is before the epoch: {e}"))
    }

    /// The host name this agent runs on.
    fn hostname(_ctx: &OpCtx, _args: CallArgs) -> OpResult {
        nix::unistd::gethostname()
            .map_err(|e| format!("gethostname failed: {e}"))
            .map(|h| Value::Str(h.to_string_lossy().into_owned()))
    }

    /// The default-route source address of this host, or null.
    fn ip(_ctx: &OpCtx, _args: CallArgs) -> OpResult {
        let output = std::process::Command::new("ip")
            .args(["-o", "route"])
            .output()
            .map_err(|e| format!("cannot run ip: {e}"))?;
        for line in String::from_utf8_lossy(&output.stdout).lines() {
            let words: Vec<&str> = line.split_whitespace().collect();
            if let ["default", "via", gateway, ..] = words.as_slice() {
                return Ok(Value::Str((*gateway).to_owned()));
            }
        }
        Ok(Value::Null)
    }

    /// Sleeps for the given number of milliseconds. Blocks its worker,
    /// not the agent.
    fn sleep_ms(_ctx: &OpCtx, args: CallArgs) -> OpResult {
        let ms = args
            .get(0)
            .and_then(Value::as_int)
            .and_then(|n| u64::try_from(n).ok())
            .ok_or("argument 0 must be a non-negative integer")?;
        std::thread::sleep(Duration::from_millis(ms));
        Ok(Value::Int(i64::try_from(ms).unwrap_or(i64::MAX)))
    }

    /// Fetches a resource from the controller and returns its bytes.
    fn read_resource(ctx: &OpCtx, args: CallArgs) -> OpResult {
        let key = args.str_arg(0)?;
        ctx.resource(key).map(Value::Bytes)
    }

    /// Whether a resource key is already in this agent's cache.
    fn resource_cached(ctx: &OpCtx, args: CallArgs) -> OpResult {
        Ok(Value::Bool(ctx.resource_cached(args.str_arg(0)?)))
    }

    /// Connects a nested tunnel to a further host and runs an operation
    /// there: `nest_call(agent_binary, host, op, args...)`. The chain of
    /// host names accumulates, so the depth limit applies end to end.
    async fn nest_call(_ctx: OpCtx, args: CallArgs) -> OpResult {
        let agent = args.str_arg(0)?.to_owned();
        let host = args.str_arg(1)?.to_owned();
        let op = args.str_arg(2)?.to_owned();
        let rest: Vec<Value> = args.args.get(3..).unwrap_or_default().to_vec();

        let tunnel = Tunnel::new(host, Launch::local().agent_argv(vec![agent]));
        tunnel.connect().await.map_err(|e| e.to_string())?;
        let result = tunnel.call(&op, rest).await.map_err(|e| e.to_string());
        let _ = tunnel.close().await;
        result
    }
}
