//! Client-facing LDAPv3 listener.
//!
//! Each accepted connection gets its own task. Messages are framed with `ldap3_proto`'s codec and
//! dispatched to the [`ProxyHandler`]. Only bind, search, unbind and abandon are served; every
//! other operation gets its own response type carrying `unwillingToPerform`.

use crate::codec::ClientCodec;
use crate::filter::{escape_value, FilterError, FilterNode};
use crate::handler::ProxyHandler;
use crate::Result;
use futures::{SinkExt, StreamExt};
use ldap3_proto::proto::{
    LdapBindCred, LdapBindRequest, LdapBindResponse, LdapDerefAliases, LdapExtendedResponse,
    LdapFilter, LdapMsg, LdapOp, LdapPartialAttribute, LdapResult, LdapResultCode,
    LdapSearchRequest, LdapSearchResultEntry, LdapSearchResultReference, LdapSearchScope,
};
use ldap3_proto::LdapCodec;
use ldap_proxy_core::types::{
    DerefPolicy, DirectoryEntry, ResultCode, SearchParams, SearchResponse, SearchScope,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Accepts client connections and serves them with a shared [`ProxyHandler`].
#[derive(Debug, Clone)]
pub struct LdapServer {
    handler: Arc<ProxyHandler>,
}

impl LdapServer {
    /// Creates a server around a handler.
    #[must_use]
    pub fn new(handler: Arc<ProxyHandler>) -> Self {
        Self { handler }
    }

    /// Runs the accept loop forever.
    ///
    /// Accept errors are logged and the loop continues.
    pub async fn run(self, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((socket, peer)) => {
                    let handler = Arc::clone(&self.handler);
                    tokio::spawn(
                        async move {
                            debug!("client connected");
                            serve_connection(handler, socket).await;
                            debug!("client disconnected");
                        }
                        .instrument(info_span!("client", %peer)),
                    );
                }
                Err(err) => error!(error = %err, "failed to accept client connection"),
            }
        }
    }
}

/// Binds `addr` and serves clients until the task is dropped.
///
/// # Errors
///
/// Returns an error if the listen socket cannot be bound.
pub async fn serve(addr: SocketAddr, handler: Arc<ProxyHandler>) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "LDAP proxy listening");
    LdapServer::new(handler).run(listener).await;
    Ok(())
}

async fn serve_connection<S>(handler: Arc<ProxyHandler>, stream: S)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    let mut requests = FramedRead::new(reader, ClientCodec::default());
    let mut responses = FramedWrite::new(writer, LdapCodec::default());

    while let Some(message) = requests.next().await {
        let message = match message {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, "failed to decode client message");
                return;
            }
        };

        let Some(replies) = dispatch(&handler, message).await else {
            return;
        };
        for reply in replies {
            if let Err(err) = responses.send(reply).await {
                debug!(error = %err, "failed to write response");
                return;
            }
        }
    }
}

/// Produces the responses to one client message, or `None` when the connection should close.
async fn dispatch(handler: &ProxyHandler, message: LdapMsg) -> Option<Vec<LdapMsg>> {
    let LdapMsg { msgid, op, .. } = message;
    let replies = match op {
        LdapOp::BindRequest(request) => vec![bind(handler, msgid, request).await],
        LdapOp::SearchRequest(request) => search(handler, msgid, &request).await,
        LdapOp::UnbindRequest => return None,
        LdapOp::AbandonRequest(_) => Vec::new(),
        other => {
            warn!(msgid, operation = ?other, "refusing unsupported operation");
            vec![message_for(msgid, refusal(&other))]
        }
    };
    Some(replies)
}

/// The response paired with `request`, carrying `unwillingToPerform`.
fn refusal(request: &LdapOp) -> LdapOp {
    let res = ldap_result(
        LdapResultCode::UnwillingToPerform,
        "operation not supported by this proxy",
    );
    match request {
        LdapOp::AddRequest(_) => LdapOp::AddResponse(res),
        LdapOp::DelRequest(_) => LdapOp::DelResponse(res),
        LdapOp::ModifyRequest(_) => LdapOp::ModifyResponse(res),
        LdapOp::ModifyDNRequest(_) => LdapOp::ModifyDNResponse(res),
        LdapOp::CompareRequest(_) => LdapOp::CompareResult(res),
        _ => LdapOp::ExtendedResponse(LdapExtendedResponse {
            res,
            name: None,
            value: None,
        }),
    }
}

async fn bind(handler: &ProxyHandler, msgid: i32, request: LdapBindRequest) -> LdapMsg {
    let code = match &request.cred {
        LdapBindCred::Simple(password) => handler.bind(&request.dn, password).await,
        LdapBindCred::SASL(_) => {
            warn!(dn = %request.dn, "refusing SASL bind");
            ResultCode::UnwillingToPerform
        }
    };
    message_for(
        msgid,
        LdapOp::BindResponse(LdapBindResponse {
            res: ldap_result(result_code(code), ""),
            saslcreds: None,
        }),
    )
}

async fn search(handler: &ProxyHandler, msgid: i32, request: &LdapSearchRequest) -> Vec<LdapMsg> {
    let params = match search_params(request) {
        Ok(params) => params,
        Err(err) => {
            warn!(base_dn = %request.base, error = %err, "cannot forward client filter");
            return vec![search_done(msgid, ResultCode::OperationsError)];
        }
    };
    search_replies(msgid, handler.search(&params).await)
}

fn search_replies(msgid: i32, response: SearchResponse) -> Vec<LdapMsg> {
    let SearchResponse {
        entries,
        referrals,
        code,
    } = response;

    let mut replies: Vec<LdapMsg> = entries
        .into_iter()
        .map(|entry| message_for(msgid, LdapOp::SearchResultEntry(wire_entry(entry))))
        .collect();
    if !referrals.is_empty() {
        replies.push(message_for(
            msgid,
            LdapOp::SearchResultReference(LdapSearchResultReference { uris: referrals }),
        ));
    }
    replies.push(search_done(msgid, code));
    replies
}

fn search_done(msgid: i32, code: ResultCode) -> LdapMsg {
    message_for(
        msgid,
        LdapOp::SearchResultDone(ldap_result(result_code(code), "")),
    )
}

fn message_for(msgid: i32, op: LdapOp) -> LdapMsg {
    LdapMsg {
        msgid,
        op,
        ctrl: Vec::new(),
    }
}

fn ldap_result(code: LdapResultCode, message: &str) -> LdapResult {
    LdapResult {
        code,
        matcheddn: String::new(),
        message: message.to_string(),
        referral: Vec::new(),
    }
}

const fn result_code(code: ResultCode) -> LdapResultCode {
    match code {
        ResultCode::Success => LdapResultCode::Success,
        ResultCode::OperationsError => LdapResultCode::OperationsError,
        ResultCode::SizeLimitExceeded => LdapResultCode::SizeLimitExceeded,
        ResultCode::InvalidCredentials => LdapResultCode::InvalidCredentials,
        ResultCode::UnwillingToPerform => LdapResultCode::UnwillingToPerform,
    }
}

fn search_params(request: &LdapSearchRequest) -> std::result::Result<SearchParams, FilterError> {
    let filter = FilterNode::from(&request.filter).encode()?;
    Ok(SearchParams {
        base_dn: request.base.clone(),
        scope: match request.scope {
            LdapSearchScope::Base => SearchScope::Base,
            LdapSearchScope::OneLevel => SearchScope::OneLevel,
            LdapSearchScope::Subtree => SearchScope::Subtree,
            LdapSearchScope::Children => SearchScope::Children,
        },
        deref: match request.aliases {
            LdapDerefAliases::Never => DerefPolicy::Never,
            LdapDerefAliases::InSearching => DerefPolicy::Searching,
            LdapDerefAliases::FindingBaseObj => DerefPolicy::FindingBase,
            LdapDerefAliases::Always => DerefPolicy::Always,
        },
        size_limit: request.sizelimit,
        time_limit: request.timelimit,
        types_only: request.typesonly,
        filter,
        attributes: request.attrs.clone(),
    })
}

fn wire_entry(entry: DirectoryEntry) -> LdapSearchResultEntry {
    LdapSearchResultEntry {
        dn: entry.dn,
        attributes: entry
            .attributes
            .into_iter()
            .map(|attribute| LdapPartialAttribute {
                atype: attribute.name,
                vals: attribute.values,
            })
            .collect(),
    }
}

impl From<&LdapFilter> for FilterNode {
    fn from(filter: &LdapFilter) -> Self {
        let escape = |value: &str| escape_value(value.as_bytes());
        match filter {
            LdapFilter::And(children) => Self::And(children.iter().map(Self::from).collect()),
            LdapFilter::Or(children) => Self::Or(children.iter().map(Self::from).collect()),
            LdapFilter::Not(child) => Self::Not(Box::new(Self::from(child.as_ref()))),
            LdapFilter::Equality(attribute, value) => Self::Equality {
                attribute: attribute.clone(),
                value: escape(value),
            },
            LdapFilter::Substring(attribute, substring) => Self::Substring {
                attribute: attribute.clone(),
                initial: substring.initial.as_deref().map(escape),
                any: substring.any.iter().map(|fragment| escape(fragment)).collect(),
                final_: substring.final_.as_deref().map(escape),
            },
            LdapFilter::GreaterOrEqual(attribute, value) => Self::GreaterOrEqual {
                attribute: attribute.clone(),
                value: escape(value),
            },
            LdapFilter::LessOrEqual(attribute, value) => Self::LessOrEqual {
                attribute: attribute.clone(),
                value: escape(value),
            },
            LdapFilter::Approx(attribute, value) => Self::Approx {
                attribute: attribute.clone(),
                value: escape(value),
            },
            LdapFilter::Present(attribute) => Self::Present(attribute.clone()),
            LdapFilter::Extensible(assertion) => Self::Extensible {
                attribute: assertion.type_.clone(),
                dn_attributes: assertion.dn_attributes,
                matching_rule: assertion.matching_rule.clone(),
                value: escape(&assertion.match_value),
            },
        }
    }
}
