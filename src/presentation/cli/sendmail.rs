//! The sendmail-compatible front end of `enqueue`.
//!
//! Programs that shell out to `sendmail` pass a mix of flags we do not care
//! about. Only the envelope sender and explicit recipients are honoured; the
//! rest comes from the message headers.

use mailparse::{MailAddr, MailHeader, MailHeaderMap};

use crate::{
    application::usecases::enqueue_message::EnqueueMessageRequest, domain::errors::RelayError,
};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SendmailArgs {
    pub sender: Option<String>,
    pub recipients: Vec<String>,
}

impl SendmailArgs {
    pub fn parse<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut parsed = SendmailArgs::default();
        let mut args = args.into_iter().map(Into::into);

        while let Some(arg) = args.next() {
            if arg == "--" {
                parsed.recipients.extend(args.by_ref());
                break;
            }
            if !arg.starts_with('-') {
                parsed.recipients.push(arg);
                continue;
            }
            match arg.as_str() {
                // A trailing `-f` without a value is ignored.
                "-f" => {
                    if let Some(sender) = args.next() {
                        parsed.sender = Some(sender);
                    }
                }
                // Full name of the sender, unused.
                "-F" => {
                    args.next();
                }
                flag if flag.starts_with("-f") => parsed.sender = Some(flag[2..].to_string()),
                _ => {}
            }
        }

        parsed
    }

    /// Combines the command line with the message headers.
    ///
    /// `-f` wins over `From`; explicit recipients win over `To`, `Cc` and `Bcc`.
    /// Header problems never stop the message from being queued; they are
    /// returned next to the request for the caller to report.
    pub fn into_request(self, raw: Vec<u8>) -> (EnqueueMessageRequest, Vec<RelayError>) {
        let mut problems = Vec::new();
        let headers = match mailparse::parse_headers(&raw) {
            Ok((headers, _)) => headers,
            Err(err) => {
                problems.push(RelayError::Input(format!("unparseable message headers: {err}")));
                Vec::new()
            }
        };

        let sender = match self.sender {
            Some(sender) => sender,
            None => headers
                .get_first_header("From")
                .and_then(|header| addresses(header, &mut problems).into_iter().next())
                .unwrap_or_default(),
        };

        let recipients = if self.recipients.is_empty() {
            let mut recipients = Vec::new();
            for name in ["To", "Cc", "Bcc"] {
                for header in headers.get_all_headers(name) {
                    recipients.extend(addresses(header, &mut problems));
                }
            }
            recipients
        } else {
            self.recipients
        };

        let request = EnqueueMessageRequest {
            sender,
            recipients,
            body: raw,
        };
        (request, problems)
    }
}

/// Bare addresses of an address header, groups expanded. A value that does not
/// parse is kept verbatim so delivery can report it.
fn addresses(header: &MailHeader, problems: &mut Vec<RelayError>) -> Vec<String> {
    match mailparse::addrparse_header(header) {
        Ok(list) => list
            .iter()
            .flat_map(|addr| match addr {
                MailAddr::Single(single) => vec![single.addr.clone()],
                MailAddr::Group(group) => group.addrs.iter().map(|s| s.addr.clone()).collect(),
            })
            .collect(),
        Err(err) => {
            problems.push(RelayError::Input(format!(
                "unparseable {} header: {err}",
                header.get_key()
            )));
            let raw = header.get_value();
            let raw = raw.trim();
            if raw.is_empty() {
                Vec::new()
            } else {
                vec![raw.to_string()]
            }
        }
    }
}
