use super::{
    commands::{delete, expires_in, get, info, notify, set},
    init::Context,
};
use crate::server::error::{LockboxError, Result};

const SET: &str = "SET";
const GET: &str = "GET";
const DELETE: &str = "DEL";
const EXPIRES_IN: &str = "EXIN";
const NOTIFY: &str = "NOTIFY";
const INFO: &str = "INFO";

const INVALID: &str = "error:invalid command";

pub async fn dispatcher(command: String, ctx: &Context) -> Result<String> {
    if command == INFO {
        return info(ctx);
    }

    let splited: Vec<&str> = command.splitn(3, ' ').collect();

    if splited.len() < 2 || splited[1].is_empty() {
        return Ok(INVALID.into());
    }

    let command_name = splited[0];
    let key = splited[1];

    match command_name {
        SET => match parse_set_command(&command) {
            Ok((key, value, seconds)) => set(&key, value, &ctx.storage, seconds),
            Err(_) => Ok("error:set command invalid".into()),
        },
        GET => get(key, &ctx.storage),
        DELETE => delete(key, &ctx.storage),
        EXPIRES_IN => expires_in(key, &ctx.storage),
        NOTIFY => match splited.get(2).map(|m| m.trim()) {
            Some(message) if !message.is_empty() => notify(key, message, ctx.sender.as_ref()).await,
            _ => Ok("error:notify command invalid".into()),
        },
        _ => Ok(INVALID.into()),
    }
}

fn parse_set_command(input: &str) -> Result<(String, String, u64)> {
    const INVALID_SET: &str = "error:set command invalid";
    let invalid = || LockboxError::InvalidCommand(INVALID_SET.into());

    let mut parts = input.splitn(3, ' ');

    if parts.next() != Some(SET) {
        return Err(invalid());
    }

    let key = parts.next().filter(|key| !key.is_empty()).ok_or_else(invalid)?;
    let remainder = parts.next().ok_or_else(invalid)?.trim();
    if remainder.is_empty() {
        return Err(invalid());
    }

    let mut value = remainder.to_string();
    let mut seconds = 0;

    if let Some(idx) = remainder.rfind(" EX ") {
        let ttl_tokens: Vec<&str> = remainder[idx + 4..].split_whitespace().collect();
        match ttl_tokens.as_slice() {
            [ttl] => {
                seconds = ttl.parse::<u64>().map_err(|_| invalid())?;
                let candidate_value = remainder[..idx].trim_end();
                if candidate_value.is_empty() {
                    return Err(invalid());
                }
                value = candidate_value.to_string();
            }
            [] => return Err(invalid()),
            // More than one token after EX: the marker is part of the value.
            _ => {}
        }
    }

    Ok((key.to_string(), value, seconds))
}
