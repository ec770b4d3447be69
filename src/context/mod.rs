//! Per-request context: the bridge between an HTTP request and a Flow run.
//!
//! The context travels through the runner as its user data. Request fields
//! are exposed to programs as native functions; the terminal decision
//! (respond directly, or balance onto a cluster) is recorded as an
//! [`Action`] by native handlers and executed by the server after the run
//! completes. The VM itself never blocks: handlers that imply I/O only
//! record what should happen and signal "handled".

use std::net::IpAddr;
use std::time::Instant;

use axum::http::request::Parts;

use crate::vm::NativeRegistry;

/// What the Flow program decided to do with the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Answer directly with a fixed status and body.
    Respond { status: u16, body: String },
    /// Hand the request to a named cluster, optionally through a specific
    /// bucket.
    Proxy {
        cluster: String,
        bucket: Option<String>,
    },
}

/// Everything a Flow program may ask about the request it is routing.
#[derive(Debug)]
pub struct RequestContext {
    pub method: String,
    /// Path and query, e.g. `/search?q=x`.
    pub path: String,
    pub host: String,
    pub headers: Vec<(String, String)>,
    pub remote_ip: IpAddr,
    pub local_ip: IpAddr,
    pub body_len: usize,
    pub created_at: Instant,
    pub action: Option<Action>,
}

impl RequestContext {
    pub fn new(parts: &Parts, remote_ip: IpAddr, local_ip: IpAddr, body_len: usize) -> Self {
        let path = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        let host = parts
            .headers
            .get("host")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let headers = parts
            .headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();

        RequestContext {
            method: parts.method.as_str().to_string(),
            path,
            host,
            headers,
            remote_ip,
            local_ip,
            body_len,
            created_at: Instant::now(),
            action: None,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Register the gateway's native set.
///
/// Functions read request fields; handlers are terminal and record an
/// [`Action`] before signalling "handled" through the return slot.
pub fn register_natives(registry: &mut NativeRegistry) {
    registry.register_function("req.method", |p| {
        let value = p
            .userdata_ref::<RequestContext>()
            .map(|ctx| ctx.method.clone())
            .unwrap_or_default();
        p.set_result_str(&value);
    });

    registry.register_function("req.path", |p| {
        let value = p
            .userdata_ref::<RequestContext>()
            .map(|ctx| ctx.path.clone())
            .unwrap_or_default();
        p.set_result_str(&value);
    });

    registry.register_function("req.host", |p| {
        let value = p
            .userdata_ref::<RequestContext>()
            .map(|ctx| ctx.host.clone())
            .unwrap_or_default();
        p.set_result_str(&value);
    });

    registry.register_function("req.header", |p| {
        let name = p.string(1);
        let value = p
            .userdata_ref::<RequestContext>()
            .and_then(|ctx| ctx.header(&name).map(str::to_string))
            .unwrap_or_default();
        p.set_result_str(&value);
    });

    registry.register_function("req.bytes_in", |p| {
        let value = p
            .userdata_ref::<RequestContext>()
            .map(|ctx| ctx.body_len as i64)
            .unwrap_or(0);
        p.set_result(value);
    });

    registry.register_function("remote.ip", |p| {
        let value = p
            .userdata_ref::<RequestContext>()
            .map(|ctx| ctx.remote_ip)
            .unwrap_or(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED));
        p.set_result_ip(value);
    });

    registry.register_function("local.ip", |p| {
        let value = p
            .userdata_ref::<RequestContext>()
            .map(|ctx| ctx.local_ip)
            .unwrap_or(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED));
        p.set_result_ip(value);
    });

    // balance.cluster(name [, bucket]) -- terminal
    registry.register_handler("balance.cluster", |p| {
        let cluster = p.string(1);
        let bucket = match p.argc() {
            0 | 1 => None,
            _ => {
                let name = p.string(2);
                (!name.is_empty()).then_some(name)
            }
        };
        let mut handled = false;
        if !cluster.is_empty() {
            if let Some(ctx) = p.userdata_mut::<RequestContext>() {
                ctx.action = Some(Action::Proxy { cluster, bucket });
                handled = true;
            }
        }
        p.set_result_bool(handled);
    });

    // respond(status [, body]) -- terminal
    registry.register_handler("respond", |p| {
        let status = p.int(1);
        let body = if p.argc() >= 2 { p.string(2) } else { String::new() };
        let mut handled = false;
        if let Some(status) = u16::try_from(status).ok().filter(|s| (100..600).contains(s)) {
            if let Some(ctx) = p.userdata_mut::<RequestContext>() {
                ctx.action = Some(Action::Respond { status, body });
                handled = true;
            }
        }
        p.set_result_bool(handled);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::{Opcode, ProgramBuilder};

    fn context() -> RequestContext {
        RequestContext {
            method: "GET".into(),
            path: "/api/users?limit=5".into(),
            host: "example.test".into(),
            headers: vec![
                ("Host".into(), "example.test".into()),
                ("X-Trace".into(), "abc123".into()),
            ],
            remote_ip: "192.0.2.7".parse().unwrap(),
            local_ip: "127.0.0.1".parse().unwrap(),
            body_len: 42,
            created_at: Instant::now(),
            action: None,
        }
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let ctx = context();
        assert_eq!(ctx.header("x-trace"), Some("abc123"));
        assert_eq!(ctx.header("missing"), None);
    }

    #[test]
    fn natives_read_request_fields() {
        let mut registry = NativeRegistry::new();
        register_natives(&mut registry);

        // r1 = req.method(); r2 = req.header("X-Trace"); EXIT 1
        let mut b = ProgramBuilder::new();
        b.add_handler("main", 4);
        let method = b.add_native_function("req.method", "S");
        let header = b.add_native_function("req.header", "SS");
        let trace = b.add_string("X-Trace");
        b.emit(Opcode::Call, method, 0, 1); // argv r1..=r1
        b.emit(Opcode::SConst, 3, trace, 0);
        b.emit(Opcode::Call, header, 1, 2); // argv r2..=r3
        b.emit(Opcode::Exit, 1, 0, 0);
        let program = b.build(&registry).unwrap();

        let mut runner = program.handler("main").unwrap().create_runner();
        runner.set_userdata(Box::new(context()));
        assert!(runner.run());
        assert_eq!(runner.register_str(1), "GET");
        assert_eq!(runner.register_str(2), "abc123");
    }

    #[test]
    fn balance_handler_records_proxy_action() {
        let mut registry = NativeRegistry::new();
        register_natives(&mut registry);

        let mut b = ProgramBuilder::new();
        b.add_handler("main", 2);
        let balance = b.add_native_handler("balance.cluster", "BS");
        let name = b.add_string("web");
        b.emit(Opcode::SConst, 1, name, 0);
        b.emit(Opcode::Handler, balance, 1, 0); // argv r0..=r1
        b.emit(Opcode::Exit, 0, 0, 0);
        let program = b.build(&registry).unwrap();

        let mut runner = program.handler("main").unwrap().create_runner();
        runner.set_userdata(Box::new(context()));
        assert!(runner.run());

        let ctx = runner
            .take_userdata()
            .and_then(|d| d.downcast::<RequestContext>().ok())
            .expect("context should survive the run");
        assert_eq!(
            ctx.action,
            Some(Action::Proxy {
                cluster: "web".into(),
                bucket: None
            })
        );
    }

    #[test]
    fn respond_handler_records_response() {
        let mut registry = NativeRegistry::new();
        register_natives(&mut registry);

        let mut b = ProgramBuilder::new();
        b.add_handler("main", 3);
        let respond = b.add_native_handler("respond", "BIS");
        let body = b.add_string("forbidden");
        b.emit(Opcode::IMov, 1, 403, 0);
        b.emit(Opcode::SConst, 2, body, 0);
        b.emit(Opcode::Handler, respond, 2, 0); // argv r0..=r2
        b.emit(Opcode::Exit, 0, 0, 0);
        let program = b.build(&registry).unwrap();

        let mut runner = program.handler("main").unwrap().create_runner();
        runner.set_userdata(Box::new(context()));
        assert!(runner.run());

        let ctx = runner
            .take_userdata()
            .and_then(|d| d.downcast::<RequestContext>().ok())
            .expect("context should survive the run");
        assert_eq!(
            ctx.action,
            Some(Action::Respond {
                status: 403,
                body: "forbidden".into()
            })
        );
    }
}
