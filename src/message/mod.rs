//! Typed SIP message values consumed by the transaction layer.
//!
//! Parsing and wire serialisation live outside this crate; the transaction
//! machinery only needs requests and responses with the handful of header
//! accessors required for correlation (top Via branch, CSeq, Call-ID,
//! From/To tags) plus header-copy helpers for ACK and `100 Trying`
//! synthesis. `Display` renders a plausible wire form for logs and tests.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use rand::Rng;

use crate::error::{Error, Result};

/// The RFC 3261 branch magic cookie marking a `branch` parameter that was
/// generated by an RFC 3261 compliant element.
pub const RFC3261_BRANCH_MAGIC_COOKIE: &str = "z9hG4bK";

/// Generates a globally unique `branch` parameter: the magic cookie followed
/// by 16 random lower-case hex characters.
pub fn generate_branch() -> String {
    let suffix: u64 = rand::thread_rng().gen();
    format!("{}{:016x}", RFC3261_BRANCH_MAGIC_COOKIE, suffix)
}

/// SIP request methods.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Invite,
    Ack,
    Bye,
    Cancel,
    Register,
    Options,
    Info,
    Prack,
    Subscribe,
    Notify,
    Refer,
    Message,
    Update,
    /// A method this crate does not know about; carried verbatim.
    Extension(String),
}

impl Method {
    pub fn as_str(&self) -> &str {
        match self {
            Method::Invite => "INVITE",
            Method::Ack => "ACK",
            Method::Bye => "BYE",
            Method::Cancel => "CANCEL",
            Method::Register => "REGISTER",
            Method::Options => "OPTIONS",
            Method::Info => "INFO",
            Method::Prack => "PRACK",
            Method::Subscribe => "SUBSCRIBE",
            Method::Notify => "NOTIFY",
            Method::Refer => "REFER",
            Method::Message => "MESSAGE",
            Method::Update => "UPDATE",
            Method::Extension(m) => m,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "INVITE" => Method::Invite,
            "ACK" => Method::Ack,
            "BYE" => Method::Bye,
            "CANCEL" => Method::Cancel,
            "REGISTER" => Method::Register,
            "OPTIONS" => Method::Options,
            "INFO" => Method::Info,
            "PRACK" => Method::Prack,
            "SUBSCRIBE" => Method::Subscribe,
            "NOTIFY" => Method::Notify,
            "REFER" => Method::Refer,
            "MESSAGE" => Method::Message,
            "UPDATE" => Method::Update,
            other => Method::Extension(other.to_string()),
        })
    }
}

/// A SIP URI, reduced to the parts the transaction layer touches.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Uri {
    pub scheme: String,
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
}

impl Uri {
    pub fn sip(user: impl Into<String>, host: impl Into<String>) -> Self {
        Uri {
            scheme: "sip".to_string(),
            user: Some(user.into()),
            host: host.into(),
            port: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.scheme)?;
        if let Some(user) = &self.user {
            write!(f, "{}@", user)?;
        }
        f.write_str(&self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        Ok(())
    }
}

impl FromStr for Uri {
    type Err = Error;

    /// Accepts the `scheme:[user@]host[:port]` shape used throughout tests.
    /// This is a convenience, not a general URI parser.
    fn from_str(s: &str) -> Result<Self> {
        let (scheme, rest) = s
            .split_once(':')
            .ok_or_else(|| Error::MalformedMessage(format!("URI without scheme: {}", s)))?;
        let (user, hostport) = match rest.split_once('@') {
            Some((user, hostport)) => (Some(user.to_string()), hostport),
            None => (None, rest),
        };
        let (host, port) = match hostport.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| Error::MalformedMessage(format!("bad URI port: {}", s)))?;
                (host.to_string(), Some(port))
            }
            None => (hostport.to_string(), None),
        };
        Ok(Uri {
            scheme: scheme.to_string(),
            user,
            host,
            port,
        })
    }
}

/// A `name=value` (or bare flag) header parameter.
pub type Param = (String, Option<String>);

fn param_lookup<'a>(params: &'a [Param], name: &str) -> Option<&'a str> {
    params
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .and_then(|(_, v)| v.as_deref())
}

fn write_params(f: &mut fmt::Formatter<'_>, params: &[Param]) -> fmt::Result {
    for (k, v) in params {
        match v {
            Some(v) => write!(f, ";{}={}", k, v)?,
            None => write!(f, ";{}", k)?,
        }
    }
    Ok(())
}

/// One hop of a Via header. The transaction layer only inspects the first
/// (top-most) hop of the first Via header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViaHop {
    /// Transport token from the sent-protocol, e.g. `UDP`, `TCP`.
    pub transport: String,
    pub host: String,
    pub port: Option<u16>,
    pub params: Vec<Param>,
}

impl ViaHop {
    pub fn new(transport: impl Into<String>, host: impl Into<String>, port: Option<u16>) -> Self {
        ViaHop {
            transport: transport.into(),
            host: host.into(),
            port,
            params: Vec::new(),
        }
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.params.push(("branch".to_string(), Some(branch.into())));
        self
    }

    /// The `branch` parameter, if present and non-empty.
    pub fn branch(&self) -> Option<&str> {
        param_lookup(&self.params, "branch").filter(|b| !b.is_empty())
    }

    /// The port to send responses back to: the explicit port, or 5060.
    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or(5060)
    }
}

impl fmt::Display for ViaHop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIP/2.0/{} {}", self.transport, self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        write_params(f, &self.params)
    }
}

/// A Via header: an ordered list of hops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Via(pub Vec<ViaHop>);

impl fmt::Display for Via {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, hop) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            hop.fmt(f)?;
        }
        Ok(())
    }
}

/// A From/To/Contact style address with parameters (notably `tag`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameAddr {
    pub display_name: Option<String>,
    pub uri: Uri,
    pub params: Vec<Param>,
}

impl NameAddr {
    pub fn new(uri: Uri) -> Self {
        NameAddr {
            display_name: None,
            uri,
            params: Vec::new(),
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.params.push(("tag".to_string(), Some(tag.into())));
        self
    }

    pub fn tag(&self) -> Option<&str> {
        param_lookup(&self.params, "tag")
    }
}

impl fmt::Display for NameAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = &self.display_name {
            write!(f, "\"{}\" ", name)?;
        }
        write!(f, "<{}>", self.uri)?;
        write_params(f, &self.params)
    }
}

/// A CSeq header: sequence number plus method name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CSeq {
    pub seq: u32,
    pub method: Method,
}

impl CSeq {
    pub fn new(seq: u32, method: Method) -> Self {
        CSeq { seq, method }
    }
}

impl fmt::Display for CSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.seq, self.method)
    }
}

/// A typed SIP header. Headers the transaction layer never interprets are
/// carried through [`Header::Other`] untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Header {
    Via(Via),
    From(NameAddr),
    To(NameAddr),
    Contact(NameAddr),
    CallId(String),
    CSeq(CSeq),
    Route(String),
    MaxForwards(u32),
    Timestamp(String),
    ContentLength(u64),
    Other(String, String),
}

impl Header {
    /// Canonical header field name.
    pub fn name(&self) -> &str {
        match self {
            Header::Via(_) => "Via",
            Header::From(_) => "From",
            Header::To(_) => "To",
            Header::Contact(_) => "Contact",
            Header::CallId(_) => "Call-ID",
            Header::CSeq(_) => "CSeq",
            Header::Route(_) => "Route",
            Header::MaxForwards(_) => "Max-Forwards",
            Header::Timestamp(_) => "Timestamp",
            Header::ContentLength(_) => "Content-Length",
            Header::Other(name, _) => name,
        }
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Header::Via(v) => write!(f, "Via: {}", v),
            Header::From(a) => write!(f, "From: {}", a),
            Header::To(a) => write!(f, "To: {}", a),
            Header::Contact(a) => write!(f, "Contact: {}", a),
            Header::CallId(v) => write!(f, "Call-ID: {}", v),
            Header::CSeq(v) => write!(f, "CSeq: {}", v),
            Header::Route(v) => write!(f, "Route: {}", v),
            Header::MaxForwards(v) => write!(f, "Max-Forwards: {}", v),
            Header::Timestamp(v) => write!(f, "Timestamp: {}", v),
            Header::ContentLength(v) => write!(f, "Content-Length: {}", v),
            Header::Other(name, v) => write!(f, "{}: {}", name, v),
        }
    }
}

/// Shared header-list behaviour for requests and responses.
pub trait HasHeaders {
    fn headers(&self) -> &[Header];
    fn headers_mut(&mut self) -> &mut Vec<Header>;

    /// All headers with the given field name, in order.
    fn headers_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Header>
    where
        Self: Sized,
    {
        self.headers()
            .iter()
            .filter(move |h| h.name().eq_ignore_ascii_case(name))
    }

    fn add_header(&mut self, header: Header) {
        self.headers_mut().push(header);
    }

    /// First Via header, if any.
    fn via(&self) -> Option<&Via> {
        self.headers().iter().find_map(|h| match h {
            Header::Via(v) => Some(v),
            _ => None,
        })
    }

    /// Top-most hop of the first Via header.
    fn via_hop(&self) -> Option<&ViaHop> {
        self.via().and_then(|v| v.0.first())
    }

    /// `branch` parameter of the top Via hop.
    fn branch(&self) -> Option<&str> {
        self.via_hop().and_then(|hop| hop.branch())
    }

    fn from(&self) -> Option<&NameAddr> {
        self.headers().iter().find_map(|h| match h {
            Header::From(a) => Some(a),
            _ => None,
        })
    }

    fn from_tag(&self) -> Option<&str> {
        self.from().and_then(|a| a.tag())
    }

    fn to(&self) -> Option<&NameAddr> {
        self.headers().iter().find_map(|h| match h {
            Header::To(a) => Some(a),
            _ => None,
        })
    }

    fn to_tag(&self) -> Option<&str> {
        self.to().and_then(|a| a.tag())
    }

    fn call_id(&self) -> Option<&str> {
        self.headers().iter().find_map(|h| match h {
            Header::CallId(v) => Some(v.as_str()),
            _ => None,
        })
    }

    fn cseq(&self) -> Option<&CSeq> {
        self.headers().iter().find_map(|h| match h {
            Header::CSeq(v) => Some(v),
            _ => None,
        })
    }
}

/// Copies every header named `name` from `src` to `dst`, preserving order.
pub fn copy_headers(name: &str, src: &impl HasHeaders, dst: &mut impl HasHeaders) {
    let copied: Vec<Header> = src
        .headers()
        .iter()
        .filter(|h| h.name().eq_ignore_ascii_case(name))
        .cloned()
        .collect();
    for h in copied {
        dst.add_header(h);
    }
}

/// A parsed SIP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    /// The Request-URI.
    pub recipient: Uri,
    pub version: String,
    pub headers: Vec<Header>,
    pub body: Bytes,
}

impl Request {
    pub fn new(method: Method, recipient: Uri) -> Self {
        Request {
            method,
            recipient,
            version: "SIP/2.0".to_string(),
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_header(mut self, header: Header) -> Self {
        self.headers.push(header);
        self
    }

    /// One-line summary for logs.
    pub fn short(&self) -> String {
        format!("{} {}", self.method, self.recipient)
    }
}

impl HasHeaders for Request {
    fn headers(&self) -> &[Header] {
        &self.headers
    }

    fn headers_mut(&mut self) -> &mut Vec<Header> {
        &mut self.headers
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}\r\n", self.method, self.recipient, self.version)?;
        for h in &self.headers {
            write!(f, "{}\r\n", h)?;
        }
        f.write_str("\r\n")?;
        if !self.body.is_empty() {
            f.write_str(&String::from_utf8_lossy(&self.body))?;
        }
        Ok(())
    }
}

/// A parsed SIP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub reason: String,
    pub version: String,
    pub headers: Vec<Header>,
    pub body: Bytes,
}

impl Response {
    pub fn new(status: u16, reason: impl Into<String>) -> Self {
        Response {
            status,
            reason: reason.into(),
            version: "SIP/2.0".to_string(),
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_header(mut self, header: Header) -> Self {
        self.headers.push(header);
        self
    }

    /// 1xx.
    pub fn is_provisional(&self) -> bool {
        (100..200).contains(&self.status)
    }

    /// 2xx.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// 3xx and above.
    pub fn is_redirection_or_error(&self) -> bool {
        self.status >= 300
    }

    /// Any non-provisional response.
    pub fn is_final(&self) -> bool {
        self.status >= 200
    }

    /// One-line summary for logs.
    pub fn short(&self) -> String {
        format!("{} {}", self.status, self.reason)
    }
}

impl HasHeaders for Response {
    fn headers(&self) -> &[Header] {
        &self.headers
    }

    fn headers_mut(&mut self) -> &mut Vec<Header> {
        &mut self.headers
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}\r\n", self.version, self.status, self.reason)?;
        for h in &self.headers {
            write!(f, "{}\r\n", h)?;
        }
        f.write_str("\r\n")?;
        if !self.body.is_empty() {
            f.write_str(&String::from_utf8_lossy(&self.body))?;
        }
        Ok(())
    }
}

/// Either kind of SIP message, as delivered by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Request(Request),
    Response(Response),
}

impl Message {
    pub fn is_request(&self) -> bool {
        matches!(self, Message::Request(_))
    }

    pub fn is_response(&self) -> bool {
        matches!(self, Message::Response(_))
    }

    pub fn method(&self) -> Option<&Method> {
        match self {
            Message::Request(req) => Some(&req.method),
            Message::Response(_) => None,
        }
    }

    pub fn branch(&self) -> Option<&str> {
        match self {
            Message::Request(req) => req.branch(),
            Message::Response(res) => res.branch(),
        }
    }

    pub fn cseq(&self) -> Option<&CSeq> {
        match self {
            Message::Request(req) => req.cseq(),
            Message::Response(res) => res.cseq(),
        }
    }

    pub fn short(&self) -> String {
        match self {
            Message::Request(req) => req.short(),
            Message::Response(res) => res.short(),
        }
    }
}

impl From<Request> for Message {
    fn from(req: Request) -> Self {
        Message::Request(req)
    }
}

impl From<Response> for Message {
    fn from(res: Response) -> Self {
        Message::Response(res)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Request(req) => req.fmt(f),
            Message::Response(res) => res.fmt(f),
        }
    }
}
