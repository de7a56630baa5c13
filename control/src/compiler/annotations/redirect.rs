//! Redirect annotations
//!
//! At most one action may be set; `redirect.response-status` only makes sense
//! next to an action and defaults to 302.

use super::Annotations;
use crate::error::{CompilerError, Result};
use url::Url;

pub const URL_SET: &str = "redirect.url-set";
pub const URL_FROM_QUERY: &str = "redirect.url-from-query";
pub const URL_PREFIX_ADD: &str = "redirect.url-prefix-add";
pub const SCHEME_SET: &str = "redirect.scheme-set";
pub const RESPONSE_STATUS: &str = "redirect.response-status";

pub const DEFAULT_STATUS: u16 = 302;
const ALLOWED_STATUS: [u16; 5] = [301, 302, 303, 307, 308];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RedirectCommand {
    UrlSet,
    UrlFromQuery,
    UrlPrefixAdd,
    SchemeSet,
}

impl RedirectCommand {
    const ALL: [(RedirectCommand, &'static str); 4] = [
        (RedirectCommand::UrlSet, URL_SET),
        (RedirectCommand::UrlFromQuery, URL_FROM_QUERY),
        (RedirectCommand::UrlPrefixAdd, URL_PREFIX_ADD),
        (RedirectCommand::SchemeSet, SCHEME_SET),
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RedirectCommand::UrlSet => "URL_SET",
            RedirectCommand::UrlFromQuery => "URL_FROM_QUERY",
            RedirectCommand::UrlPrefixAdd => "URL_PREFIX_ADD",
            RedirectCommand::SchemeSet => "SCHEME_SET",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RedirectAction {
    pub command: RedirectCommand,
    pub param: String,
    pub status: u16,
}

pub fn parse_redirect(annotations: &Annotations<'_>) -> Result<Option<RedirectAction>> {
    let present: Vec<_> = RedirectCommand::ALL
        .iter()
        .filter(|(_, suffix)| annotations.contains(suffix))
        .collect();

    let (command, suffix) = match present.as_slice() {
        [] => {
            if let Some(status) = annotations.get(RESPONSE_STATUS) {
                return Err(CompilerError::validation(format!(
                    "unexpected annotation: {{{}:{}}}",
                    annotations.key(RESPONSE_STATUS),
                    status
                )));
            }
            return Ok(None);
        }
        [single] => **single,
        _ => {
            return Err(CompilerError::validation(
                "setting multiple redirection-related annotations at the same time is not supported",
            ))
        }
    };

    let param = annotations.get(suffix).unwrap_or_default().trim().to_string();
    check_param(command, &param, &annotations.key(suffix))?;

    let status = parse_status(annotations)?;

    Ok(Some(RedirectAction {
        command,
        param,
        status,
    }))
}

fn check_param(command: RedirectCommand, param: &str, key: &str) -> Result<()> {
    if param.is_empty() {
        return Err(CompilerError::validation(format!(
            "the value of {} can not be empty",
            key
        )));
    }

    match command {
        RedirectCommand::UrlSet => {
            Url::parse(param).map_err(|e| {
                CompilerError::validation(format!(
                    "the value of {} should be a valid URL string: {}",
                    key, e
                ))
            })?;
        }
        RedirectCommand::UrlFromQuery => {}
        RedirectCommand::UrlPrefixAdd => {
            let url = Url::parse(param).map_err(|e| {
                CompilerError::validation(format!(
                    "the value of {} should be a valid URL string: {}",
                    key, e
                ))
            })?;
            if url.fragment().is_some() {
                return Err(CompilerError::validation(format!(
                    "the value of {} should not contain a fragment",
                    key
                )));
            }
        }
        RedirectCommand::SchemeSet => {
            if param != "http" && param != "https" {
                return Err(CompilerError::validation(format!(
                    "the value of {} should be http or https, got {}",
                    key, param
                )));
            }
        }
    }
    Ok(())
}

fn parse_status(annotations: &Annotations<'_>) -> Result<u16> {
    let Some(raw) = annotations.get(RESPONSE_STATUS).filter(|v| !v.is_empty()) else {
        return Ok(DEFAULT_STATUS);
    };

    let status: u16 = raw.trim().parse().map_err(|_| {
        CompilerError::validation(format!(
            "the annotation {} should be an integer, got {}",
            annotations.key(RESPONSE_STATUS),
            raw
        ))
    })?;

    if !ALLOWED_STATUS.contains(&status) {
        return Err(CompilerError::validation(format!(
            "unsupported redirect status code {}, expected one of {:?}",
            status, ALLOWED_STATUS
        )));
    }
    Ok(status)
}
