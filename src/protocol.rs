//! Whiteboard Protocol
//!
//! Tagged binary encoding for the messages exchanged through the relay.
//! Each encoded message is carried as one length-prefixed frame (see
//! [`crate::frame`]); the encoding below describes the frame payload only.
//!
//! | Tag | Body |
//! |---|---|
//! | `D` | x1, y1, x2, y2 as big-endian `u16` |
//! | `R` / `C` | same body as `D` |
//! | `T` | x, y as big-endian `u16`, then UTF-8 text to the end |
//! | `M` | UTF-8 text to the end |
//! | `F` | `uploader|filename|` then raw content |
//! | `U` | usernames joined by `|` |
//! | `PUBLIC_KEY|` | `username|` then base64 key bytes |
//! | `SESSION_KEY|` | `username|` then base64 wrapped key |
//! | `ENCRYPTED_CHAT|` | `target|` then raw ciphertext |

use std::path::Path;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use thiserror::Error;

const TAG_DRAW: u8 = b'D';
const TAG_RECT: u8 = b'R';
const TAG_CIRCLE: u8 = b'C';
const TAG_TEXT: u8 = b'T';
const TAG_CHAT: u8 = b'M';
const TAG_FILE: u8 = b'F';
const TAG_USER_LIST: u8 = b'U';

const TOKEN_PUBLIC_KEY: &[u8] = b"PUBLIC_KEY|";
const TOKEN_SESSION_KEY: &[u8] = b"SESSION_KEY|";
const TOKEN_ENCRYPTED_CHAT: &[u8] = b"ENCRYPTED_CHAT|";

/// Field separator inside text-keyed frames
pub const SEPARATOR: u8 = b'|';

/// Shape drawn by an `R` or `C` frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShapeKind {
    Rect,
    Circle,
}

impl ShapeKind {
    fn tag(self) -> u8 {
        match self {
            ShapeKind::Rect => TAG_RECT,
            ShapeKind::Circle => TAG_CIRCLE,
        }
    }
}

/// Messages exchanged between whiteboard clients through the relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Draw {
        x1: u16,
        y1: u16,
        x2: u16,
        y2: u16,
    },
    Shape {
        kind: ShapeKind,
        x1: u16,
        y1: u16,
        x2: u16,
        y2: u16,
    },
    Text {
        x: u16,
        y: u16,
        body: String,
    },
    Chat {
        body: String,
    },
    /// Chat encrypted under the session key shared with `target`
    EncryptedChat {
        target: String,
        ciphertext: Vec<u8>,
    },
    File {
        uploader: String,
        filename: String,
        content: Vec<u8>,
    },
    UserList {
        names: Vec<String>,
    },
    PublicKey {
        username: String,
        key_bytes: Vec<u8>,
    },
    /// Session key wrapped for `username`
    SessionKey {
        username: String,
        wrapped_key: Vec<u8>,
    },
}

/// Reasons a frame payload cannot be decoded into a [`Message`]
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("empty frame")]
    Empty,
    #[error("unknown tag 0x{0:02x}")]
    UnknownTag(u8),
    #[error("{tag} frame truncated: need {needed} bytes, got {got}")]
    Truncated {
        tag: &'static str,
        needed: usize,
        got: usize,
    },
    #[error("{tag} frame is missing its {field} field")]
    MissingField {
        tag: &'static str,
        field: &'static str,
    },
    #[error("{tag} frame carries invalid UTF-8")]
    InvalidUtf8 { tag: &'static str },
    #[error("{tag} frame carries invalid base64")]
    InvalidBase64 { tag: &'static str },
}

impl Message {
    /// Build a `File` message from a local path, keeping only its basename
    pub fn file(uploader: impl Into<String>, path: &Path, content: Vec<u8>) -> Self {
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        Message::File {
            uploader: uploader.into(),
            filename,
            content,
        }
    }

    /// Short name used in log lines
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Draw { .. } => "draw",
            Message::Shape {
                kind: ShapeKind::Rect,
                ..
            } => "rect",
            Message::Shape {
                kind: ShapeKind::Circle,
                ..
            } => "circle",
            Message::Text { .. } => "text",
            Message::Chat { .. } => "chat",
            Message::EncryptedChat { .. } => "encrypted_chat",
            Message::File { .. } => "file",
            Message::UserList { .. } => "user_list",
            Message::PublicKey { .. } => "public_key",
            Message::SessionKey { .. } => "session_key",
        }
    }

    /// Encode the message into a frame payload
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Message::Draw { x1, y1, x2, y2 } => encode_segment(TAG_DRAW, [*x1, *y1, *x2, *y2]),
            Message::Shape {
                kind,
                x1,
                y1,
                x2,
                y2,
            } => encode_segment(kind.tag(), [*x1, *y1, *x2, *y2]),
            Message::Text { x, y, body } => {
                let mut out = Vec::with_capacity(5 + body.len());
                out.push(TAG_TEXT);
                out.extend_from_slice(&x.to_be_bytes());
                out.extend_from_slice(&y.to_be_bytes());
                out.extend_from_slice(body.as_bytes());
                out
            }
            Message::Chat { body } => {
                let mut out = Vec::with_capacity(1 + body.len());
                out.push(TAG_CHAT);
                out.extend_from_slice(body.as_bytes());
                out
            }
            Message::File {
                uploader,
                filename,
                content,
            } => {
                let mut out =
                    Vec::with_capacity(3 + uploader.len() + filename.len() + content.len());
                out.push(TAG_FILE);
                out.extend_from_slice(uploader.as_bytes());
                out.push(SEPARATOR);
                out.extend_from_slice(filename.as_bytes());
                out.push(SEPARATOR);
                out.extend_from_slice(content);
                out
            }
            Message::UserList { names } => {
                let mut out = vec![TAG_USER_LIST];
                out.extend_from_slice(names.join("|").as_bytes());
                out
            }
            Message::PublicKey {
                username,
                key_bytes,
            } => encode_keyed(TOKEN_PUBLIC_KEY, username, B64.encode(key_bytes).as_bytes()),
            Message::SessionKey {
                username,
                wrapped_key,
            } => encode_keyed(
                TOKEN_SESSION_KEY,
                username,
                B64.encode(wrapped_key).as_bytes(),
            ),
            Message::EncryptedChat { target, ciphertext } => {
                encode_keyed(TOKEN_ENCRYPTED_CHAT, target, ciphertext)
            }
        }
    }

    /// Decode one frame payload
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let (&tag, body) = data.split_first().ok_or(DecodeError::Empty)?;

        match tag {
            TAG_DRAW => {
                let [x1, y1, x2, y2] = decode_segment("draw", body)?;
                Ok(Message::Draw { x1, y1, x2, y2 })
            }
            TAG_RECT | TAG_CIRCLE => {
                let (kind, name) = if tag == TAG_RECT {
                    (ShapeKind::Rect, "rect")
                } else {
                    (ShapeKind::Circle, "circle")
                };
                let [x1, y1, x2, y2] = decode_segment(name, body)?;
                Ok(Message::Shape {
                    kind,
                    x1,
                    y1,
                    x2,
                    y2,
                })
            }
            TAG_TEXT => {
                if body.len() < 4 {
                    return Err(DecodeError::Truncated {
                        tag: "text",
                        needed: 5,
                        got: data.len(),
                    });
                }
                let x = u16::from_be_bytes([body[0], body[1]]);
                let y = u16::from_be_bytes([body[2], body[3]]);
                let body = utf8("text", &body[4..])?;
                Ok(Message::Text { x, y, body })
            }
            TAG_CHAT => Ok(Message::Chat {
                body: utf8("chat", body)?,
            }),
            TAG_FILE => {
                // Exactly two separators; the content after them is opaque.
                let (uploader, rest) = split_field(body).ok_or(DecodeError::MissingField {
                    tag: "file",
                    field: "uploader",
                })?;
                let (filename, content) = split_field(rest).ok_or(DecodeError::MissingField {
                    tag: "file",
                    field: "filename",
                })?;
                Ok(Message::File {
                    uploader: utf8("file", uploader)?,
                    filename: utf8("file", filename)?,
                    content: content.to_vec(),
                })
            }
            TAG_USER_LIST => {
                let text = utf8("user_list", body)?;
                let names = if text.is_empty() {
                    Vec::new()
                } else {
                    text.split('|').map(str::to_string).collect()
                };
                Ok(Message::UserList { names })
            }
            _ if data.starts_with(TOKEN_PUBLIC_KEY) => {
                let (username, payload) =
                    decode_keyed("public_key", &data[TOKEN_PUBLIC_KEY.len()..])?;
                Ok(Message::PublicKey {
                    username,
                    key_bytes: base64_field("public_key", payload)?,
                })
            }
            _ if data.starts_with(TOKEN_SESSION_KEY) => {
                let (username, payload) =
                    decode_keyed("session_key", &data[TOKEN_SESSION_KEY.len()..])?;
                Ok(Message::SessionKey {
                    username,
                    wrapped_key: base64_field("session_key", payload)?,
                })
            }
            _ if data.starts_with(TOKEN_ENCRYPTED_CHAT) => {
                let (target, payload) =
                    decode_keyed("encrypted_chat", &data[TOKEN_ENCRYPTED_CHAT.len()..])?;
                Ok(Message::EncryptedChat {
                    target,
                    ciphertext: payload.to_vec(),
                })
            }
            other => Err(DecodeError::UnknownTag(other)),
        }
    }
}

/// True if the payload carries a `File` tag. The relay uses this to decide
/// whether a frame needs parsing at all.
pub fn is_file_frame(payload: &[u8]) -> bool {
    payload.first() == Some(&TAG_FILE)
}

fn encode_segment(tag: u8, coords: [u16; 4]) -> Vec<u8> {
    let mut out = Vec::with_capacity(9);
    out.push(tag);
    for c in coords {
        out.extend_from_slice(&c.to_be_bytes());
    }
    out
}

fn decode_segment(tag: &'static str, body: &[u8]) -> Result<[u16; 4], DecodeError> {
    if body.len() < 8 {
        return Err(DecodeError::Truncated {
            tag,
            needed: 9,
            got: body.len() + 1,
        });
    }
    let mut coords = [0u16; 4];
    for (i, chunk) in body[..8].chunks_exact(2).enumerate() {
        coords[i] = u16::from_be_bytes([chunk[0], chunk[1]]);
    }
    Ok(coords)
}

fn encode_keyed(token: &[u8], name: &str, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(token.len() + name.len() + 1 + payload.len());
    out.extend_from_slice(token);
    out.extend_from_slice(name.as_bytes());
    out.push(SEPARATOR);
    out.extend_from_slice(payload);
    out
}

fn decode_keyed<'a>(tag: &'static str, rest: &'a [u8]) -> Result<(String, &'a [u8]), DecodeError> {
    let (name, payload) = split_field(rest).ok_or(DecodeError::MissingField {
        tag,
        field: "username",
    })?;
    Ok((utf8(tag, name)?, payload))
}

/// Split at the first separator, dropping it
fn split_field(data: &[u8]) -> Option<(&[u8], &[u8])> {
    let pos = data.iter().position(|&b| b == SEPARATOR)?;
    Some((&data[..pos], &data[pos + 1..]))
}

fn utf8(tag: &'static str, bytes: &[u8]) -> Result<String, DecodeError> {
    String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::InvalidUtf8 { tag })
}

fn base64_field(tag: &'static str, payload: &[u8]) -> Result<Vec<u8>, DecodeError> {
    B64.decode(payload)
        .map_err(|_| DecodeError::InvalidBase64 { tag })
}
