//! Transaction keys: the correlation identifiers of RFC 3261 §17.1.3 and
//! §17.2.3.
//!
//! Requests and responses are keyed differently. A server key is derived
//! from an incoming request's top Via hop and CSeq method (with an RFC 2543
//! fallback when the branch lacks the magic cookie); a client key comes from
//! the branch this element generated plus the CSeq method, and matches the
//! responses to an outbound request. ACK always folds into INVITE so that
//! ACKs for non-2xx finals land on the INVITE transaction.

use std::fmt;

use crate::error::{Error, Result};
use crate::message::{HasHeaders, Message, Method, Request, Response, RFC3261_BRANCH_MAGIC_COOKIE};

/// Joins key components. `$` cannot appear in any of the joined header
/// tokens, so the flattened form stays collision-free.
const KEY_SEPARATOR: &str = "$";

/// An opaque, equatable transaction identifier.
///
/// Stable for the lifetime of a transaction: re-deriving the key from a
/// stored transaction's origin request yields the value it was stored under.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct TransactionKey(String);

impl TransactionKey {
    /// Server transaction key for an incoming request (RFC 3261 §17.2.3).
    ///
    /// With an RFC 3261 branch the key is
    /// `branch $ via-host $ via-port $ method`; otherwise the RFC 2543
    /// fallback `request-uri $ from-tag $ call-id $ method $ cseq-seq $ via`
    /// applies. ACK is keyed as INVITE.
    pub fn server(req: &Request) -> Result<Self> {
        let hop = req
            .via_hop()
            .ok_or_else(|| malformed(req, "missing or empty Via header"))?;
        let cseq = req
            .cseq()
            .ok_or_else(|| malformed(req, "missing CSeq header"))?;
        let method = fold_ack(&cseq.method);

        if let Some(branch) = hop.branch().filter(|b| is_rfc3261_branch(b)) {
            let port = hop.effective_port().to_string();
            return Ok(TransactionKey(
                [branch, hop.host.as_str(), port.as_str(), method.as_str()].join(KEY_SEPARATOR),
            ));
        }

        // RFC 2543 back-compat: no usable branch, fall back to the wider
        // tuple.
        let from_tag = req
            .from_tag()
            .ok_or_else(|| malformed(req, "missing From tag"))?;
        let call_id = req
            .call_id()
            .ok_or_else(|| malformed(req, "missing Call-ID header"))?;
        let recipient = req.recipient.to_string();
        let seq = cseq.seq.to_string();
        let via = hop.to_string();
        Ok(TransactionKey(
            [
                recipient.as_str(),
                from_tag,
                call_id,
                method.as_str(),
                seq.as_str(),
                via.as_str(),
            ]
            .join(KEY_SEPARATOR),
        ))
    }

    /// Client transaction key (RFC 3261 §17.1.3): `branch $ method`, with
    /// ACK keyed as INVITE. Derived from the origin request when storing and
    /// from a received response when matching.
    ///
    /// Unlike the server side there is no pre-3261 fallback; a missing or
    /// cookieless branch is an error.
    pub fn client(msg: &Message) -> Result<Self> {
        match msg {
            Message::Request(req) => Self::client_from_request(req),
            Message::Response(res) => Self::client_from_response(res),
        }
    }

    /// Client key for an origin request being stored.
    pub fn client_from_request(req: &Request) -> Result<Self> {
        Self::client_parts(req.branch(), req.cseq(), || req.short())
    }

    /// Client key for a received response being matched.
    pub fn client_from_response(res: &Response) -> Result<Self> {
        Self::client_parts(res.branch(), res.cseq(), || res.short())
    }

    fn client_parts(
        branch: Option<&str>,
        cseq: Option<&crate::message::CSeq>,
        short: impl Fn() -> String,
    ) -> Result<Self> {
        let cseq = cseq
            .ok_or_else(|| Error::MalformedMessage(format!("{}: missing CSeq header", short())))?;
        let method = fold_ack(&cseq.method);
        match branch.filter(|b| is_rfc3261_branch(b)) {
            Some(branch) => Ok(TransactionKey::from_parts(branch, &method)),
            None => Err(Error::MalformedBranch(short())),
        }
    }

    /// Assembles a client-side key directly. Used when a request arrives at
    /// [`send`](crate::manager::TransactionManager::send) without a usable
    /// branch and the transaction must still get an identity for logging
    /// and cleanup.
    pub(crate) fn from_parts(branch: &str, method: &Method) -> Self {
        TransactionKey([branch, method.as_str()].join(KEY_SEPARATOR))
    }
}

impl fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for TransactionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransactionKey({})", self.0)
    }
}

/// An RFC 3261 branch carries the magic cookie plus at least one more
/// character.
fn is_rfc3261_branch(branch: &str) -> bool {
    branch.starts_with(RFC3261_BRANCH_MAGIC_COOKIE)
        && branch.len() > RFC3261_BRANCH_MAGIC_COOKIE.len()
}

/// ACK is part of the INVITE transaction for keying purposes.
fn fold_ack(method: &Method) -> Method {
    if *method == Method::Ack {
        Method::Invite
    } else {
        method.clone()
    }
}

fn malformed(req: &Request, what: &str) -> Error {
    Error::MalformedMessage(format!("{}: {}", req.short(), what))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{generate_branch, CSeq, Header, NameAddr, Uri, Via, ViaHop};

    fn request(method: Method, branch: Option<&str>) -> Request {
        let mut hop = ViaHop::new("UDP", "client.example.com", Some(5060));
        if let Some(b) = branch {
            hop = hop.with_branch(b);
        }
        Request::new(method.clone(), Uri::sip("bob", "example.com"))
            .with_header(Header::Via(Via(vec![hop])))
            .with_header(Header::From(
                NameAddr::new(Uri::sip("alice", "example.com")).with_tag("fromtag1"),
            ))
            .with_header(Header::To(NameAddr::new(Uri::sip("bob", "example.com"))))
            .with_header(Header::CallId("call-1".to_string()))
            .with_header(Header::CSeq(CSeq::new(1, method)))
    }

    fn response(status: u16, cseq_method: Method, branch: &str) -> Response {
        Response::new(status, "OK")
            .with_header(Header::Via(Via(vec![ViaHop::new(
                "UDP",
                "client.example.com",
                Some(5060),
            )
            .with_branch(branch)])))
            .with_header(Header::CSeq(CSeq::new(1, cseq_method)))
    }

    #[test]
    fn rfc3261_server_key_joins_branch_sentby_method() {
        let req = request(Method::Invite, Some("z9hG4bKabc123"));
        let key = TransactionKey::server(&req).unwrap();
        assert_eq!(
            key.to_string(),
            "z9hG4bKabc123$client.example.com$5060$INVITE"
        );
    }

    #[test]
    fn server_key_folds_ack_into_invite() {
        let invite = request(Method::Invite, Some("z9hG4bKabc123"));
        let ack = request(Method::Ack, Some("z9hG4bKabc123"));
        assert_eq!(
            TransactionKey::server(&invite).unwrap(),
            TransactionKey::server(&ack).unwrap()
        );
    }

    #[test]
    fn cookieless_branch_takes_rfc2543_path() {
        let req = request(Method::Register, Some("1-old-style"));
        let key = TransactionKey::server(&req).unwrap();
        let rendered = key.to_string();
        assert!(rendered.starts_with("sip:bob@example.com$fromtag1$call-1$REGISTER$1$"));
        assert!(rendered.contains("SIP/2.0/UDP client.example.com:5060"));
    }

    #[test]
    fn bare_cookie_is_not_an_rfc3261_branch() {
        // The cookie with nothing after it falls back to RFC 2543 keying.
        let req = request(Method::Invite, Some(RFC3261_BRANCH_MAGIC_COOKIE));
        let key = TransactionKey::server(&req).unwrap();
        assert!(key.to_string().starts_with("sip:bob@example.com$"));
    }

    #[test]
    fn rfc2543_path_requires_from_tag() {
        let mut req = request(Method::Invite, None);
        req.headers.retain(|h| h.name() != "From");
        assert!(matches!(
            TransactionKey::server(&req),
            Err(Error::MalformedMessage(_))
        ));
    }

    #[test]
    fn server_key_requires_via() {
        let mut req = request(Method::Invite, Some("z9hG4bKabc123"));
        req.headers.retain(|h| h.name() != "Via");
        assert!(matches!(
            TransactionKey::server(&req),
            Err(Error::MalformedMessage(_))
        ));
    }

    #[test]
    fn client_key_matches_between_request_and_response() {
        let branch = generate_branch();
        let req = request(Method::Invite, Some(&branch));
        let stored = TransactionKey::client(&Message::Request(req)).unwrap();
        let matched =
            TransactionKey::client_from_response(&response(200, Method::Invite, &branch)).unwrap();
        assert_eq!(stored, matched);
    }

    #[test]
    fn client_key_folds_ack_into_invite() {
        let branch = generate_branch();
        let invite = TransactionKey::client(&Message::Request(request(
            Method::Invite,
            Some(&branch),
        )))
        .unwrap();
        let ack =
            TransactionKey::client(&Message::Request(request(Method::Ack, Some(&branch)))).unwrap();
        assert_eq!(invite, ack);
    }

    #[test]
    fn client_key_rejects_malformed_branch() {
        let req = request(Method::Options, Some("not-a-cookie"));
        assert!(matches!(
            TransactionKey::client(&Message::Request(req)),
            Err(Error::MalformedBranch(_))
        ));

        let req = request(Method::Options, None);
        assert!(matches!(
            TransactionKey::client(&Message::Request(req)),
            Err(Error::MalformedBranch(_))
        ));
    }

    #[test]
    fn distinct_methods_give_distinct_keys() {
        let branch = generate_branch();
        let invite =
            TransactionKey::client(&Message::Request(request(Method::Invite, Some(&branch))))
                .unwrap();
        let bye = TransactionKey::client(&Message::Request(request(Method::Bye, Some(&branch))))
            .unwrap();
        assert_ne!(invite, bye);
    }
}
