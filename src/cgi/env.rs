//! Construction of the CGI/1.1 environment (RFC 3875, Section 4.1).
//!
//! The environment is built from a [`Parts`] and static [`ServerInfo`] alone,
//! so identical requests always produce identical environments. Nothing is
//! read from the gateway's own process environment here; variables that
//! should reach scripts are passed in explicitly.

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::fmt::Debug;
use std::io::Write;
use std::iter::FusedIterator;
use std::net::IpAddr;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;

use compact_str::CompactString;
use http::header;

use super::{OwnedVarName, SmallBytes, StaticVarName, VarName};
use crate::request::Parts;


/// Static metadata of the server hosting the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    /// `SERVER_SOFTWARE`, conventionally `name/version`.
    pub software: CompactString,
    /// `SERVER_NAME`, the host name clients use to reach the server.
    pub name: CompactString,
    pub port: u16,
    /// `SERVER_ADDR`, the local address the request arrived on.
    pub addr: Option<IpAddr>,
    /// `DOCUMENT_ROOT`, also used to derive `PATH_TRANSLATED`.
    pub document_root: Option<PathBuf>,
}

impl Default for ServerInfo {
    fn default() -> Self {
        Self {
            software: concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")).into(),
            name: "localhost".into(),
            port: 80,
            addr: None,
            document_root: None,
        }
    }
}


/// What the script is told about the size of its input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodySize {
    /// There is no request body.
    None,
    /// The body is exactly this long. Sets `CONTENT_LENGTH` if nonzero.
    Known(u64),
    /// The body is streamed until end-of-file.
    Unknown,
}

impl BodySize {
    #[inline]
    fn has_body(self) -> bool {
        !matches!(self, BodySize::None | BodySize::Known(0))
    }
}


/// An immutable CGI/1.1 environment for a single script invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environment {
    vars: BTreeMap<OwnedVarName, SmallBytes>,
}

impl Environment {
    /// Builds the environment for a request.
    ///
    /// `passthrough` variables are inserted first, so they never override
    /// variables derived from the request. `HTTP_*` variables are derived from the request
    /// headers, except for `Content-Type` and `Content-Length` (which have
    /// dedicated variables) and `Proxy` (which scripts would mistake for a
    /// proxy setting). Repeated headers are joined into a single value.
    #[must_use]
    pub fn build(
        parts: &Parts<'_>,
        server: &ServerInfo,
        body: BodySize,
        passthrough: &[(OwnedVarName, SmallBytes)],
    ) -> Self {
        use StaticVarName::*;

        let mut env = Self { vars: passthrough.iter().cloned().collect() };
        for (name, value) in parts.headers {
            if *name == header::CONTENT_TYPE || *name == header::CONTENT_LENGTH || name == "proxy" {
                continue;
            }
            let Some(var) = OwnedVarName::from_header(name) else { continue };
            let sep: &[u8] = if *name == header::COOKIE { b"; " } else { b", " };
            env.vars.entry(var)
                .and_modify(|v| {
                    v.extend_from_slice(sep);
                    v.extend_from_slice(value.as_bytes());
                })
                .or_insert_with(|| SmallBytes::from_slice(value.as_bytes()));
        }

        env.set(GATEWAY_INTERFACE, "CGI/1.1");
        env.set(SERVER_SOFTWARE, server.software.as_bytes());
        env.set(SERVER_NAME, server.name.as_bytes());
        env.set_display(SERVER_PORT, server.port);
        env.set_display(SERVER_PROTOCOL, format_args!("{:?}", parts.version));
        if let Some(addr) = server.addr {
            env.set_display(SERVER_ADDR, addr);
        }

        env.set(REQUEST_METHOD, parts.method.as_str());
        env.set(REQUEST_URI, parts.request_uri());
        env.set(SCRIPT_NAME, parts.script_name);
        env.set(SCRIPT_FILENAME, parts.script.as_os_str().as_bytes());
        env.set(PATH_INFO, parts.path_info);
        env.set(QUERY_STRING, parts.query());
        if let Some(root) = &server.document_root {
            env.set(DOCUMENT_ROOT, root.as_os_str().as_bytes());
            if !parts.path_info.is_empty() {
                let translated = root.join(parts.path_info.trim_start_matches('/'));
                env.set(PATH_TRANSLATED, translated.as_os_str().as_bytes());
            }
        }

        let remote = parts.remote_addr;
        env.set_display(REMOTE_ADDR, remote.ip());
        env.set_display(REMOTE_HOST, remote.ip());
        env.set_display(REMOTE_PORT, remote.port());
        env.set(REDIRECT_STATUS, "200");

        if body.has_body() {
            if let Some(ctype) = parts.headers.get(header::CONTENT_TYPE) {
                env.set(CONTENT_TYPE, ctype.as_bytes());
            }
        }
        if let BodySize::Known(len @ 1..) = body {
            env.set_display(CONTENT_LENGTH, len);
        }
        env
    }

    fn set(&mut self, name: StaticVarName, value: impl AsRef<[u8]>) {
        self.vars.insert(name.into(), SmallBytes::from_slice(value.as_ref()));
    }

    fn set_display(&mut self, name: StaticVarName, value: impl std::fmt::Display) {
        let mut buf = SmallBytes::new();
        // Writing into a SmallVec cannot fail
        if write!(buf, "{value}").is_ok() {
            self.vars.insert(name.into(), buf);
        }
    }

    /// Returns the number of variables in the environment.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Tests whether the given variable is set.
    #[must_use]
    pub fn contains(&self, name: &VarName) -> bool {
        self.vars.contains_key(name)
    }

    /// Retrieves the value stored for the variable name, if there is one.
    #[must_use]
    pub fn get(&self, name: &VarName) -> Option<&[u8]> {
        self.vars.get(name).map(AsRef::as_ref)
    }

    /// Attempts to retrieve the string value stored for the variable name.
    ///
    /// Returns [`None`] if there is no corresponding value *or if the value
    /// is not valid UTF-8*.
    #[must_use]
    pub fn get_str(&self, name: &VarName) -> Option<&str> {
        self.vars.get(name).and_then(|b| std::str::from_utf8(b).ok())
    }

    /// Returns an iterator over all variables, ordered by name.
    #[inline]
    pub fn iter(&self) -> impl ExactSizeIterator<Item = (&OwnedVarName, &[u8])>
            + FusedIterator + Clone + Debug + '_
    {
        self.vars.iter().map(|(k, v)| (k, v.as_ref()))
    }

    /// Returns an iterator suitable for `Command::envs`.
    #[inline]
    pub fn os_iter(&self) -> impl Iterator<Item = (&OsStr, &OsStr)> + '_ {
        self.vars.iter().map(|(k, v)| (k.as_os_str(), OsStr::from_bytes(v)))
    }
}


/// Collects the variables from the gateway's own environment that should be
/// passed to scripts. Names that are not set are skipped.
#[must_use]
pub fn resolve_passthrough<S: AsRef<str>>(names: &[S]) -> Vec<(OwnedVarName, SmallBytes)> {
    names
        .iter()
        .filter_map(|name| {
            let name = name.as_ref();
            let value = std::env::var_os(name)?;
            Some((OwnedVarName::from(name), SmallBytes::from_slice(value.as_bytes())))
        })
        .collect()
}
