// src/server/command.rs - Line-oriented command parsing
use thiserror::Error;

/// One parsed client request. Every argument kind is a typed variant
/// field; a line either parses into exactly one of these or fails
/// with a usage message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Status,
    StatusWait { timeout_ms: u64 },
    SetPattern {
        offset_x: u32,
        offset_y: u32,
        merge: bool,
        byte_len: usize,
    },
    GetPattern { rawdata: bool },
    EditPattern(EditOp),
    SetRow { row: i32 },
    SetOffset { offset: i32 },
    SetKnitMode { on: bool },
    SetRepeatMode { mode: crate::knit::RepeatMode },
    HwMock { position: i32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditOp {
    Clear,
    Trim,
    Center,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("unknown command: {0}")]
    Unknown(String),
    #[error("usage: {0}")]
    Usage(&'static str),
    #[error("invalid integer argument: {0}")]
    BadInt(String),
    #[error("invalid boolean argument: {0}")]
    BadBool(String),
    #[error("invalid repeat mode: {0} (expected oneshot, repeat or manual)")]
    BadRepeatMode(String),
}

fn parse_int<T: std::str::FromStr>(token: &str) -> Result<T, CommandError> {
    token
        .parse()
        .map_err(|_| CommandError::BadInt(token.to_string()))
}

fn parse_bool(token: &str) -> Result<bool, CommandError> {
    match token.to_ascii_lowercase().as_str() {
        "1" | "on" | "true" | "yes" => Ok(true),
        "0" | "off" | "false" | "no" => Ok(false),
        _ => Err(CommandError::BadBool(token.to_string())),
    }
}

impl Command {
    pub fn parse(line: &str) -> Result<Command, CommandError> {
        let tokens: Vec<&str> = line.split_ascii_whitespace().collect();
        let (&name, args) = match tokens.split_first() {
            Some(split) => split,
            None => return Err(CommandError::Unknown(String::new())),
        };
        match (name, args) {
            ("status", []) => Ok(Command::Status),
            ("status", _) => Err(CommandError::Usage("status")),
            ("statuswait", [timeout]) => Ok(Command::StatusWait {
                timeout_ms: parse_int(timeout)?,
            }),
            ("statuswait", _) => Err(CommandError::Usage("statuswait <timeout_ms>")),
            ("setpattern", [ox, oy, merge, len]) => Ok(Command::SetPattern {
                offset_x: parse_int(ox)?,
                offset_y: parse_int(oy)?,
                merge: parse_bool(merge)?,
                byte_len: parse_int(len)?,
            }),
            ("setpattern", _) => Err(CommandError::Usage(
                "setpattern <offsetx> <offsety> <merge> <byte_length>",
            )),
            ("getpattern", [raw]) => Ok(Command::GetPattern {
                rawdata: parse_bool(raw)?,
            }),
            ("getpattern", _) => Err(CommandError::Usage("getpattern <rawdata>")),
            ("editpattern", [op]) => {
                let op = match *op {
                    "clr" => EditOp::Clear,
                    "trim" => EditOp::Trim,
                    "center" => EditOp::Center,
                    other => return Err(CommandError::Unknown(format!("editpattern {other}"))),
                };
                Ok(Command::EditPattern(op))
            }
            ("editpattern", _) => Err(CommandError::Usage("editpattern <clr|trim|center>")),
            ("setrow", [row]) => Ok(Command::SetRow {
                row: parse_int(row)?,
            }),
            ("setrow", _) => Err(CommandError::Usage("setrow <row_id>")),
            ("setoffset", [offset]) => Ok(Command::SetOffset {
                offset: parse_int(offset)?,
            }),
            ("setoffset", _) => Err(CommandError::Usage("setoffset <offset>")),
            ("setknitmode", [mode]) => Ok(Command::SetKnitMode {
                on: parse_bool(mode)?,
            }),
            ("setknitmode", _) => Err(CommandError::Usage("setknitmode <on|off>")),
            ("setrepeatmode", [mode]) => {
                let mode = crate::knit::RepeatMode::parse(mode)
                    .ok_or_else(|| CommandError::BadRepeatMode((*mode).to_string()))?;
                Ok(Command::SetRepeatMode { mode })
            }
            ("setrepeatmode", _) => {
                Err(CommandError::Usage("setrepeatmode <oneshot|repeat|manual>"))
            }
            ("hwmock", ["setpos", position]) => Ok(Command::HwMock {
                position: parse_int(position)?,
            }),
            ("hwmock", _) => Err(CommandError::Usage("hwmock setpos <position>")),
            (other, _) => Err(CommandError::Unknown(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knit::RepeatMode;

    #[test]
    fn parses_argument_free_commands() {
        assert_eq!(Command::parse("status").unwrap(), Command::Status);
        assert_eq!(Command::parse("  status \n").unwrap(), Command::Status);
        assert!(matches!(
            Command::parse("status extra"),
            Err(CommandError::Usage(_))
        ));
    }

    #[test]
    fn parses_setpattern() {
        assert_eq!(
            Command::parse("setpattern 3 5 on 1024").unwrap(),
            Command::SetPattern {
                offset_x: 3,
                offset_y: 5,
                merge: true,
                byte_len: 1024,
            }
        );
        assert!(matches!(
            Command::parse("setpattern -3 5 on 1024"),
            Err(CommandError::BadInt(_))
        ));
        assert!(matches!(
            Command::parse("setpattern 0 0 maybe 10"),
            Err(CommandError::BadBool(_))
        ));
        assert!(matches!(
            Command::parse("setpattern 0 0 on"),
            Err(CommandError::Usage(_))
        ));
    }

    #[test]
    fn boolean_spellings() {
        for (token, expected) in [
            ("1", true),
            ("ON", true),
            ("TrUe", true),
            ("yes", true),
            ("0", false),
            ("off", false),
            ("False", false),
            ("NO", false),
        ] {
            assert_eq!(
                Command::parse(&format!("setknitmode {token}")).unwrap(),
                Command::SetKnitMode { on: expected },
                "token {token}"
            );
        }
    }

    #[test]
    fn parses_edit_and_mode_commands() {
        assert_eq!(
            Command::parse("editpattern trim").unwrap(),
            Command::EditPattern(EditOp::Trim)
        );
        assert_eq!(
            Command::parse("setrepeatmode manual").unwrap(),
            Command::SetRepeatMode {
                mode: RepeatMode::Manual
            }
        );
        assert!(matches!(
            Command::parse("setrepeatmode forever"),
            Err(CommandError::BadRepeatMode(_))
        ));
        assert_eq!(
            Command::parse("hwmock setpos -17").unwrap(),
            Command::HwMock { position: -17 }
        );
    }

    #[test]
    fn rejects_unknown_and_empty_lines() {
        assert!(matches!(
            Command::parse("reboot"),
            Err(CommandError::Unknown(_))
        ));
        assert!(matches!(
            Command::parse("   "),
            Err(CommandError::Unknown(_))
        ));
        assert!(matches!(
            Command::parse("statuswait soon"),
            Err(CommandError::BadInt(_))
        ));
    }
}
