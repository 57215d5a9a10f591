//! IMAP wire-dialect adapter. The `imap` crate is synchronous; the producer
//! pipeline bridges each call through `tokio::task::spawn_blocking` rather
//! than this module trying to be async itself — the wire protocol is out of
//! scope for the core, only the shape of what it returns matters.

use std::collections::HashMap;
use std::net::TcpStream;

use chrono::Utc;
use imap::types::Fetch;
use imap::Session;
use native_tls::{TlsConnector, TlsStream};

use crate::core::constants::IMAP_BODY_FETCH_BYTES;
use crate::data::error::ImapError;
use crate::domain::email::EmailRecord;

use super::oauth::OAuth2Manager;

struct XOAuth2Authenticator {
    response: Vec<u8>,
}

impl imap::Authenticator for XOAuth2Authenticator {
    type Response = Vec<u8>;
    fn process(&self, _challenge: &[u8]) -> Self::Response {
        self.response.clone()
    }
}

pub struct ImapClient {
    host: String,
    port: u16,
    user: String,
    session: Option<Session<TlsStream<TcpStream>>>,
}

impl ImapClient {
    pub fn new(host: impl Into<String>, port: u16, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            user: user.into(),
            session: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    pub fn connect(&mut self, access_token: &str) -> Result<(), ImapError> {
        let tls = TlsConnector::builder()
            .build()
            .map_err(|e| ImapError::Connection(e.to_string()))?;
        let client = imap::connect((self.host.as_str(), self.port), self.host.as_str(), &tls)
            .map_err(|e| ImapError::Connection(e.to_string()))?;

        let response = OAuth2Manager::xoauth2_string(&self.user, access_token).into_bytes();
        let authenticator = XOAuth2Authenticator { response };
        let session = client
            .authenticate("XOAUTH2", &authenticator)
            .map_err(|(e, _)| ImapError::Auth(e.to_string()))?;
        self.session = Some(session);
        Ok(())
    }

    pub fn disconnect(&mut self) {
        if let Some(mut session) = self.session.take() {
            let _ = session.logout();
        }
    }

    /// Returns `(uidvalidity, message_count)`.
    pub fn select_mailbox(&mut self, mailbox: &str) -> Result<(u64, u32), ImapError> {
        let session = self.session.as_mut().ok_or_else(|| ImapError::Connection("not connected".into()))?;
        let mailbox_info = session
            .select(mailbox)
            .map_err(|e| ImapError::Protocol(e.to_string()))?;
        let uidvalidity = mailbox_info.uid_validity.unwrap_or(0) as u64;
        Ok((uidvalidity, mailbox_info.exists))
    }

    /// `UID SEARCH UID last_uid+1:*`, sorted ascending, truncated to
    /// `batch_size`.
    pub fn fetch_uids_since(&mut self, last_uid: u64, batch_size: usize) -> Result<Vec<u32>, ImapError> {
        let session = self.session.as_mut().ok_or_else(|| ImapError::Connection("not connected".into()))?;
        let query = format!("UID {}:*", last_uid + 1);
        let mut uids: Vec<u32> = session
            .uid_search(&query)
            .map_err(|e| ImapError::Protocol(e.to_string()))?
            .into_iter()
            .filter(|&uid| uid as u64 > last_uid)
            .collect();
        uids.sort_unstable();
        uids.truncate(batch_size);
        Ok(uids)
    }

    /// Fetches envelope, size, and a bounded body prefix for each UID, in
    /// ascending order, parsing each into an email record.
    pub fn fetch_messages(
        &mut self,
        uids: &[u32],
        mailbox: &str,
        uidvalidity: u64,
    ) -> Result<Vec<EmailRecord>, ImapError> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }
        let session = self.session.as_mut().ok_or_else(|| ImapError::Connection("not connected".into()))?;
        let uid_set = uids.iter().map(|u| u.to_string()).collect::<Vec<_>>().join(",");
        let fetches = session
            .uid_fetch(uid_set, "UID ENVELOPE RFC822.SIZE BODY.PEEK[]")
            .map_err(|e| ImapError::Protocol(e.to_string()))?;

        let mut by_uid: HashMap<u32, &Fetch> = HashMap::new();
        for f in fetches.iter() {
            if let Some(uid) = f.uid {
                by_uid.insert(uid, f);
            }
        }

        let mut records = Vec::with_capacity(uids.len());
        for &uid in uids {
            let Some(fetch) = by_uid.get(&uid) else {
                continue;
            };
            records.push(parse_fetch(fetch, mailbox, uidvalidity)?);
        }
        Ok(records)
    }
}

fn parse_fetch(fetch: &Fetch, mailbox: &str, uidvalidity: u64) -> Result<EmailRecord, ImapError> {
    let uid = fetch.uid.ok_or_else(|| ImapError::Parse("missing UID".into()))? as u64;
    let size = fetch.size.unwrap_or(0) as u64;
    let body_bytes = fetch.body().unwrap_or(&[]);
    let bounded = &body_bytes[..body_bytes.len().min(IMAP_BODY_FETCH_BYTES)];

    let parsed = mailparse::parse_mail(bounded).map_err(|e| ImapError::Parse(e.to_string()))?;

    let mut headers = HashMap::new();
    for header in parsed.get_headers() {
        let key = header.get_key();
        let value = header.get_value();
        headers.insert(key, value);
    }

    let from = headers.get("From").cloned().unwrap_or_default();
    let to = headers
        .get("To")
        .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
        .unwrap_or_default();
    let subject = headers.get("Subject").cloned().unwrap_or_default();
    let message_id = headers.get("Message-ID").or_else(|| headers.get("Message-Id")).cloned();
    let date = headers
        .get("Date")
        .and_then(|d| chrono::DateTime::parse_from_rfc2822(d).ok())
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    let (body_text_preview, body_html_preview) = extract_bodies(&parsed);

    Ok(EmailRecord {
        uid,
        uidvalidity,
        mailbox: mailbox.to_string(),
        from,
        to,
        subject,
        date,
        message_id,
        size,
        headers,
        body_text_preview,
        body_html_preview,
        fetched_at: Utc::now(),
    }
    .with_truncated_previews())
}

fn extract_bodies(parsed: &mailparse::ParsedMail) -> (String, String) {
    let mut text = String::new();
    let mut html = String::new();
    collect_bodies(parsed, &mut text, &mut html);
    (text, html)
}

fn collect_bodies(part: &mailparse::ParsedMail, text: &mut String, html: &mut String) {
    if part.subparts.is_empty() {
        let content_type = part.ctype.mimetype.to_ascii_lowercase();
        if let Ok(body) = part.get_body() {
            if content_type == "text/plain" && text.is_empty() {
                *text = body;
            } else if content_type == "text/html" && html.is_empty() {
                *html = body;
            }
        }
    } else {
        for sub in &part.subparts {
            collect_bodies(sub, text, html);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_bodies_prefers_first_plain_and_html_part() {
        let raw = b"Content-Type: multipart/alternative; boundary=B\r\n\r\n--B\r\nContent-Type: text/plain\r\n\r\nhello\r\n--B\r\nContent-Type: text/html\r\n\r\n<p>hello</p>\r\n--B--\r\n";
        let parsed = mailparse::parse_mail(raw).unwrap();
        let (text, html) = extract_bodies(&parsed);
        assert_eq!(text.trim(), "hello");
        assert_eq!(html.trim(), "<p>hello</p>");
    }
}
