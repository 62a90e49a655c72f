//! Command text → `Command` dispatch table, standing in for the external
//! Input Processor: the core supplies the session object and a dispatch
//! table, it does not parse a general-purpose expression language.

use crate::error::ParseError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyMode {
    Async = 0,
    Scheduled = 1,
    TopOfFrame = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Async = 0,
    WhenCopied = 1,
    Promote = 2,
}

impl CopyMode {
    fn from_code(code: i64) -> Result<Self, ParseError> {
        match code {
            0 => Ok(Self::Async),
            1 => Ok(Self::Scheduled),
            2 => Ok(Self::TopOfFrame),
            _ => Err(ParseError::MalformedArguments(format!("copy mode {code}"))),
        }
    }
}

impl WriteMode {
    fn from_code(code: i64) -> Result<Self, ParseError> {
        match code {
            0 => Ok(Self::Async),
            1 => Ok(Self::WhenCopied),
            2 => Ok(Self::Promote),
            _ => Err(ParseError::MalformedArguments(format!("write mode {code}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Add { name: String, units: Option<String> },
    Remove { name: String },
    Exit,
    Units { name: String, units: String },
    Send,
    Pause,
    Unpause,
    SetCopyMode(CopyMode),
    SetWriteMode(WriteMode),
    SetFrameMultiple(u32),
    SetFrameOffset(u32),
    SetFreezeFrameMultiple(u32),
    SetFreezeFrameOffset(u32),
    SetUpdateRate(f64),
    SetBinaryFormat { on: bool, nonames: bool },
    SetByteswap(bool),
    ValidateAddress(bool),
    SetLog(bool),
    SetSendStdio(bool),
    VarList,
    SetClientTag(String),
    /// `send_sie_class`, `send_sie_enumerations`, `send_sie_top_level_objects`,
    /// `send_sie_all`, etc. — the suffix after `send_sie_` names which slice
    /// of introspection metadata to emit (message-id 1).
    SendSie(String),
}

/// Parses one command line. Unknown commands return `UnknownCommand` so the
/// caller can decide whether to silently ignore or reply with a diagnostic;
/// a recognized command with a malformed argument list returns
/// `MalformedArguments`.
pub fn parse(line: &str) -> Result<Command, ParseError> {
    let line = line.trim();
    let body = line.strip_prefix("trick.var_").unwrap_or(line);

    let (name, args_text) = split_call(body).ok_or_else(|| ParseError::UnknownCommand(line.to_string()))?;
    let args = split_args(args_text);

    match name {
        "add" => {
            let var_name = arg_string(&args, 0)?;
            let units = args.get(1).map(|s| unquote(s));
            Ok(Command::Add { name: var_name, units })
        }
        "remove" => Ok(Command::Remove { name: arg_string(&args, 0)? }),
        "exit" => Ok(Command::Exit),
        "units" => Ok(Command::Units { name: arg_string(&args, 0)?, units: arg_string(&args, 1)? }),
        "send" => Ok(Command::Send),
        "pause" => Ok(Command::Pause),
        "unpause" => Ok(Command::Unpause),
        "set_copy_mode" => Ok(Command::SetCopyMode(CopyMode::from_code(arg_int(&args, 0)?)?)),
        "set_write_mode" => Ok(Command::SetWriteMode(WriteMode::from_code(arg_int(&args, 0)?)?)),
        "set_frame_multiple" => Ok(Command::SetFrameMultiple(arg_int(&args, 0)? as u32)),
        "set_frame_offset" => Ok(Command::SetFrameOffset(arg_int(&args, 0)? as u32)),
        "set_freeze_frame_multiple" => Ok(Command::SetFreezeFrameMultiple(arg_int(&args, 0)? as u32)),
        "set_freeze_frame_offset" => Ok(Command::SetFreezeFrameOffset(arg_int(&args, 0)? as u32)),
        "set_update_rate" => Ok(Command::SetUpdateRate(arg_float(&args, 0)?)),
        "set_binary_format" => Ok(Command::SetBinaryFormat {
            on: arg_bool(&args, 0)?,
            nonames: args.get(1).map(|s| parse_bool(s)).transpose()?.unwrap_or(false),
        }),
        "set_byteswap" => Ok(Command::SetByteswap(arg_bool(&args, 0)?)),
        "validate_address" => Ok(Command::ValidateAddress(arg_bool(&args, 0)?)),
        "log_on" => Ok(Command::SetLog(true)),
        "log_off" => Ok(Command::SetLog(false)),
        "send_stdio" => Ok(Command::SetSendStdio(arg_bool(&args, 0)?)),
        "list" | "var_list" => Ok(Command::VarList),
        "set_client_tag" => Ok(Command::SetClientTag(arg_string(&args, 0)?)),
        _ if name.starts_with("send_sie") => {
            Ok(Command::SendSie(name.strip_prefix("send_sie_").unwrap_or("all").to_string()))
        }
        _ => Err(ParseError::UnknownCommand(line.to_string())),
    }
}

fn split_call(body: &str) -> Option<(&str, &str)> {
    let open = body.find('(')?;
    let close = body.rfind(')')?;
    if close < open {
        return None;
    }
    Some((body[..open].trim(), &body[open + 1..close]))
}

fn split_args(text: &str) -> Vec<String> {
    if text.trim().is_empty() {
        return Vec::new();
    }
    let mut args = Vec::new();
    let mut depth = 0i32;
    let mut in_quotes = false;
    let mut current = String::new();
    for c in text.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            '(' if !in_quotes => {
                depth += 1;
                current.push(c);
            }
            ')' if !in_quotes => {
                depth -= 1;
                current.push(c);
            }
            ',' if !in_quotes && depth == 0 => {
                args.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        args.push(current.trim().to_string());
    }
    args
}

fn unquote(s: &str) -> String {
    let s = s.trim();
    if s.len() >= 2 && s.starts_with('"') && s.ends_with('"') {
        s[1..s.len() - 1].to_string()
    } else {
        s.to_string()
    }
}

fn arg_string(args: &[String], idx: usize) -> Result<String, ParseError> {
    args.get(idx).map(|s| unquote(s)).ok_or_else(|| ParseError::MalformedArguments(format!("missing argument {idx}")))
}

fn arg_int(args: &[String], idx: usize) -> Result<i64, ParseError> {
    args.get(idx)
        .ok_or_else(|| ParseError::MalformedArguments(format!("missing argument {idx}")))?
        .parse()
        .map_err(|_| ParseError::MalformedArguments(args[idx].clone()))
}

fn arg_float(args: &[String], idx: usize) -> Result<f64, ParseError> {
    args.get(idx)
        .ok_or_else(|| ParseError::MalformedArguments(format!("missing argument {idx}")))?
        .parse()
        .map_err(|_| ParseError::MalformedArguments(args[idx].clone()))
}

fn parse_bool(s: &str) -> Result<bool, ParseError> {
    match s.trim() {
        "1" | "true" | "True" => Ok(true),
        "0" | "false" | "False" => Ok(false),
        other => Err(ParseError::MalformedArguments(other.to_string())),
    }
}

fn arg_bool(args: &[String], idx: usize) -> Result<bool, ParseError> {
    args.get(idx)
        .ok_or_else(|| ParseError::MalformedArguments(format!("missing argument {idx}")))
        .and_then(|s| parse_bool(s))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_add_with_trick_prefix() {
        assert_eq!(
            parse(r#"trick.var_add("obj.x")"#).unwrap(),
            Command::Add { name: "obj.x".to_string(), units: None }
        );
    }

    #[test]
    fn parses_add_with_units() {
        assert_eq!(
            parse(r#"var_add("obj.x", "m")"#).unwrap(),
            Command::Add { name: "obj.x".to_string(), units: Some("m".to_string()) }
        );
    }

    #[test]
    fn parses_send_exit_pause() {
        assert_eq!(parse("trick.var_send()").unwrap(), Command::Send);
        assert_eq!(parse("trick.var_exit()").unwrap(), Command::Exit);
        assert_eq!(parse("trick.var_pause()").unwrap(), Command::Pause);
    }

    #[test]
    fn unknown_command_is_reported() {
        assert!(matches!(parse("trick.var_frobnicate()"), Err(ParseError::UnknownCommand(_))));
    }

    #[test]
    fn malformed_copy_mode_is_reported() {
        assert!(matches!(parse("trick.var_set_copy_mode(9)"), Err(ParseError::MalformedArguments(_))));
    }

    #[test]
    fn parses_send_sie_family_by_suffix() {
        assert_eq!(
            parse("trick.var_send_sie_class()").unwrap(),
            Command::SendSie("class".to_string())
        );
        assert_eq!(parse("trick.var_send_sie_all()").unwrap(), Command::SendSie("all".to_string()));
    }

    #[test]
    fn parses_binary_format_with_nonames() {
        assert_eq!(
            parse("trick.var_set_binary_format(1, 1)").unwrap(),
            Command::SetBinaryFormat { on: true, nonames: true }
        );
    }
}
