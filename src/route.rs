//! Route specifications.
//!
//! A route binds a local listen endpoint to one or more backends:
//!
//! ```text
//! <listen>=<backend>[,<backend>...]
//! <backend> := <addr>[(<key>['=<squoted>'][,...])]
//! ```
//!
//! A backend whose address contains no `:` is a logical service name that is
//! resolved through discovery at connection time; otherwise it is a literal
//! `host:port`. The two kinds cannot be mixed in a single route, and a
//! service route names exactly one service.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

use thiserror::Error;

/// Backend parameter carrying the TLS server name to present when dialing.
pub const PARAM_TLS: &str = "tls";

/// Route specification errors. Syntax errors are their own kind so callers
/// can tell a bad spec from a runtime failure.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("invalid route; expected <listen>=<backend>[,...,<backendN>] in: {0}")]
    MissingAssign(String),
    #[error("missing ',' in backend list")]
    MissingDelimiter,
    #[error("backend is empty")]
    EmptyBackend,
    #[error("unterminated parameter list")]
    UnterminatedParams,
    #[error("unexpected end of input in quoted string")]
    UnterminatedString,
    #[error("expected identifier, got {0:?}")]
    ExpectedIdent(char),
    #[error("expected '=', ',' or ')', got {0:?}")]
    UnexpectedChar(char),
    #[error("cannot mix host and service backends in the same route")]
    MixedBackends,
    #[error("a service route must have exactly one backend")]
    ServiceArity,
}

/// A single backend: a literal `host:port` or a logical service name, plus
/// an open set of parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backend {
    pub addr: String,
    pub params: BTreeMap<String, String>,
}

impl Backend {
    /// True when the address names a logical service rather than a host.
    pub fn is_service(&self) -> bool {
        !self.addr.contains(':')
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.addr)?;
        if self.params.is_empty() {
            return Ok(());
        }
        f.write_str("(")?;
        for (i, (key, value)) in self.params.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            f.write_str(key)?;
            if !value.is_empty() {
                f.write_str("='")?;
                for c in value.chars() {
                    if c == '\'' || c == '\\' {
                        f.write_str("\\")?;
                    }
                    write!(f, "{}", c)?;
                }
                f.write_str("'")?;
            }
        }
        f.write_str(")")
    }
}

/// A route maps a listen endpoint to a set of backends.
#[derive(Debug)]
pub struct Route {
    pub listen: String,
    pub backends: Vec<Backend>,
    pub service: bool,
    index: AtomicI64,
}

impl Route {
    /// Parse a route specification.
    pub fn parse(input: &str) -> Result<Route, RouteError> {
        let assign = input
            .find('=')
            .ok_or_else(|| RouteError::MissingAssign(input.to_string()))?;

        let listen = input[..assign].trim().to_string();
        let mut scan = Scanner::new(&input[assign + 1..]);
        scan.skip_white();

        let mut service = false;
        let mut backends = Vec::new();
        loop {
            let backend = parse_backend(&mut scan)?;
            let kind = backend.is_service();
            if backends.is_empty() {
                service = kind;
            } else if service != kind {
                return Err(RouteError::MixedBackends);
            }
            backends.push(backend);

            scan.skip_white();
            match scan.peek() {
                None => break,
                Some(',') => {
                    scan.bump();
                    scan.skip_white();
                }
                Some(_) => return Err(RouteError::MissingDelimiter),
            }
        }

        if service && backends.len() > 1 {
            return Err(RouteError::ServiceArity);
        }

        Ok(Route {
            listen,
            backends,
            service,
            index: AtomicI64::new(0),
        })
    }

    /// Obtain the next backend in the rotation. Wait-free; safe under any
    /// number of concurrent callers. The index may wrap; a negative value is
    /// normalized before use.
    pub fn next(&self) -> &Backend {
        if self.backends.len() == 1 {
            return &self.backends[0];
        }
        let index = self.index.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let len = self.backends.len() as i64;
        &self.backends[index.rem_euclid(len) as usize]
    }

    /// Obtain the first backend. For a service route this is the one and
    /// only logical service the route names.
    pub fn any(&self) -> &Backend {
        &self.backends[0]
    }
}

impl PartialEq for Route {
    fn eq(&self, other: &Self) -> bool {
        self.listen == other.listen
            && self.service == other.service
            && self.backends == other.backends
    }
}

impl Eq for Route {}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}=", self.listen)?;
        for (i, backend) in self.backends.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", backend)?;
        }
        Ok(())
    }
}

/// Cursor over the remaining input.
struct Scanner<'a> {
    rest: &'a str,
}

impl<'a> Scanner<'a> {
    fn new(input: &'a str) -> Self {
        Scanner { rest: input }
    }

    fn peek(&self) -> Option<char> {
        self.rest.chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.rest.chars().next()?;
        self.rest = &self.rest[c.len_utf8()..];
        Some(c)
    }

    fn skip_white(&mut self) {
        self.rest = self.rest.trim_start();
    }

    /// Consume characters while the predicate holds.
    fn take_while(&mut self, pred: impl Fn(char) -> bool) -> &'a str {
        let end = self
            .rest
            .char_indices()
            .find(|&(_, c)| !pred(c))
            .map(|(i, _)| i)
            .unwrap_or(self.rest.len());
        let (taken, rest) = self.rest.split_at(end);
        self.rest = rest;
        taken
    }
}

fn parse_backend(scan: &mut Scanner<'_>) -> Result<Backend, RouteError> {
    let name = scan.take_while(|c| !c.is_whitespace() && c != '(' && c != ',');
    if name.is_empty() {
        return Err(RouteError::EmptyBackend);
    }

    scan.skip_white();
    let params = if scan.peek() == Some('(') {
        parse_params(scan)?
    } else {
        BTreeMap::new()
    };

    Ok(Backend {
        addr: name.to_string(),
        params,
    })
}

fn parse_params(scan: &mut Scanner<'_>) -> Result<BTreeMap<String, String>, RouteError> {
    scan.bump(); // opening paren

    let mut params = BTreeMap::new();
    loop {
        scan.skip_white();
        match scan.peek() {
            None => return Err(RouteError::UnterminatedParams),
            Some(')') => {
                scan.bump();
                return Ok(params);
            }
            Some(',') => {
                scan.bump();
            }
            Some(_) => {
                let (key, value) = parse_key_value(scan)?;
                params.insert(key, value);
            }
        }
    }
}

fn parse_key_value(scan: &mut Scanner<'_>) -> Result<(String, String), RouteError> {
    let key = parse_ident(scan)?;

    scan.skip_white();
    match scan.peek() {
        // Flag-style parameter with no value; the delimiter is handled by
        // the parameter loop.
        Some(',') | Some(')') => Ok((key, String::new())),
        Some('=') => {
            scan.bump();
            scan.skip_white();
            let value = parse_quoted(scan)?;
            Ok((key, value))
        }
        Some(c) => Err(RouteError::UnexpectedChar(c)),
        None => Err(RouteError::UnterminatedParams),
    }
}

fn parse_ident(scan: &mut Scanner<'_>) -> Result<String, RouteError> {
    match scan.peek() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        Some(c) => return Err(RouteError::ExpectedIdent(c)),
        None => return Err(RouteError::UnterminatedParams),
    }
    let ident = scan.take_while(|c| c.is_ascii_alphanumeric() || c == '_');
    Ok(ident.to_string())
}

fn parse_quoted(scan: &mut Scanner<'_>) -> Result<String, RouteError> {
    match scan.peek() {
        Some('\'') => {
            scan.bump();
        }
        Some(c) => return Err(RouteError::UnexpectedChar(c)),
        None => return Err(RouteError::UnterminatedString),
    }

    let mut value = String::new();
    loop {
        match scan.bump() {
            None => return Err(RouteError::UnterminatedString),
            Some('\'') => return Ok(value),
            Some('\\') => match scan.bump() {
                Some(escaped) => value.push(escaped),
                None => return Err(RouteError::UnterminatedString),
            },
            Some(c) => value.push(c),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|&(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn backend(addr: &str, pairs: &[(&str, &str)]) -> Backend {
        Backend {
            addr: addr.to_string(),
            params: params(pairs),
        }
    }

    fn route(listen: &str, service: bool, backends: Vec<Backend>) -> Route {
        Route {
            listen: listen.to_string(),
            backends,
            service,
            index: AtomicI64::new(0),
        }
    }

    #[test]
    fn parse_host_routes() {
        assert_eq!(
            Route::parse(":9000=host:1234,other:5678").unwrap(),
            route(
                ":9000",
                false,
                vec![backend("host:1234", &[]), backend("other:5678", &[])]
            )
        );
        // Whitespace between tokens is permitted anywhere
        assert_eq!(
            Route::parse(":9000 = host:1234 , other:5678").unwrap(),
            route(
                ":9000",
                false,
                vec![backend("host:1234", &[]), backend("other:5678", &[])]
            )
        );
    }

    #[test]
    fn parse_service_routes() {
        assert_eq!(
            Route::parse(":9000=upstream").unwrap(),
            route(":9000", true, vec![backend("upstream", &[])])
        );
        assert_eq!(
            Route::parse(":9000=upstream(tls='true')").unwrap(),
            route(":9000", true, vec![backend("upstream", &[("tls", "true")])])
        );
        assert_eq!(
            Route::parse(":9000 = upstream ( tls = 'true' )").unwrap(),
            route(":9000", true, vec![backend("upstream", &[("tls", "true")])])
        );
    }

    #[test]
    fn parse_backend_params() {
        assert_eq!(
            Route::parse(":1=h:2(key_name='Value', another='Check it')").unwrap(),
            route(
                ":1",
                false,
                vec![backend(
                    "h:2",
                    &[("key_name", "Value"), ("another", "Check it")]
                )]
            )
        );
        // Flag-style parameters have no value
        assert_eq!(
            Route::parse(":1=h:2(nodelay)").unwrap(),
            route(":1", false, vec![backend("h:2", &[("nodelay", "")])])
        );
        // Backslash escapes the next character inside a quoted value
        assert_eq!(
            Route::parse(r":1=h:2(a='it\'s',b='back\\slash')").unwrap(),
            route(
                ":1",
                false,
                vec![backend("h:2", &[("a", "it's"), ("b", r"back\slash")])]
            )
        );
    }

    #[test]
    fn parse_failures() {
        assert_eq!(
            Route::parse("no-assign"),
            Err(RouteError::MissingAssign("no-assign".to_string()))
        );
        assert_eq!(
            Route::parse(":9000=host:1234(tls='x') other:1234"),
            Err(RouteError::MissingDelimiter)
        );
        assert_eq!(
            Route::parse(":9000=host:1234,"),
            Err(RouteError::EmptyBackend)
        );
        assert_eq!(Route::parse(":9000="), Err(RouteError::EmptyBackend));
        assert_eq!(
            Route::parse(":9000=host:1234(tls='x'"),
            Err(RouteError::UnterminatedParams)
        );
        assert_eq!(
            Route::parse(":9000=host:1234(tls='x"),
            Err(RouteError::UnterminatedString)
        );
        assert_eq!(
            Route::parse(":9000=host:1234(tls^)"),
            Err(RouteError::UnexpectedChar('^'))
        );
        assert_eq!(
            Route::parse(":9000=host:1234(1tls='x')"),
            Err(RouteError::ExpectedIdent('1'))
        );
    }

    #[test]
    fn classification() {
        assert!(!Route::parse(":9000=host:1234").unwrap().service);
        assert!(Route::parse(":9000=upstream").unwrap().service);
        assert_eq!(
            Route::parse(":9000=host:1234,upstream"),
            Err(RouteError::MixedBackends)
        );
        assert_eq!(
            Route::parse(":9000=upstream,host:1234"),
            Err(RouteError::MixedBackends)
        );
    }

    #[test]
    fn service_route_arity() {
        assert_eq!(
            Route::parse(":9000=upstream,downstream"),
            Err(RouteError::ServiceArity)
        );
    }

    #[test]
    fn display_round_trips() {
        let specs = [
            ":9000=upstream",
            ":9000=host:1234,other:5678",
            ":9000=upstream(tls='name.example')",
            ":9000=host:1234(tls='a'),other:1234(tls='b')",
            r":9000=h:1(a='it\'s',b='x\\y',flag)",
            "127.0.0.1:80=web:8080",
        ];
        for spec in specs {
            let parsed = Route::parse(spec).unwrap();
            let redisplayed = Route::parse(&parsed.to_string()).unwrap();
            assert_eq!(parsed, redisplayed, "route does not round-trip: {}", spec);
        }
    }

    #[test]
    fn rotation_is_fair() {
        let route = Arc::new(Route::parse(":9000=a:1,b:2,c:3,d:4").unwrap());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let route = Arc::clone(&route);
            handles.push(std::thread::spawn(move || {
                let mut counts: HashMap<String, usize> = HashMap::new();
                for _ in 0..500 {
                    *counts.entry(route.next().addr.clone()).or_default() += 1;
                }
                counts
            }));
        }

        let mut counts: HashMap<String, usize> = HashMap::new();
        for handle in handles {
            for (addr, n) in handle.join().unwrap() {
                *counts.entry(addr).or_default() += n;
            }
        }

        // 4000 calls over 4 backends with unique rotation indices: exactly
        // 1000 each.
        assert_eq!(counts.len(), 4);
        for (_, n) in counts {
            assert_eq!(n, 1000);
        }
    }

    #[test]
    fn single_backend_skips_rotation() {
        let route = Route::parse(":9000=only:1").unwrap();
        for _ in 0..10 {
            assert_eq!(route.next().addr, "only:1");
        }
        assert_eq!(route.any().addr, "only:1");
    }
}
