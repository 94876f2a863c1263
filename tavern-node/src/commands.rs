//! Line commands read from stdin while a node runs.

use std::str::FromStr;

use tavern_core::{CardId, Point, Size};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub enum NewCard {
    Text,
    Video(String),
    Image(String),
    Chat,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Add(NewCard),
    Move { id: CardId, to: Point },
    Resize { id: CardId, size: Size },
    Trash(CardId),
    Capture(CardId),
    /// Backpack slot, as listed in the snapshot.
    Release(usize),
    /// Pixels; `None` for `cursor off`.
    Cursor(Option<Point>),
    Avatar,
    Say { id: CardId, text: String },
    Region(Option<String>),
    Compact,
    Quit,
}

#[derive(Debug, Error, PartialEq)]
pub enum CommandError {
    #[error("empty command")]
    Empty,
    #[error("unknown command '{0}'")]
    Unknown(String),
    #[error("missing {0}")]
    Missing(&'static str),
    #[error("'{0}' is not a number")]
    BadNumber(String),
}

fn number<T: FromStr>(word: Option<&str>, what: &'static str) -> Result<T, CommandError> {
    let word = word.ok_or(CommandError::Missing(what))?;
    word.parse()
        .map_err(|_| CommandError::BadNumber(word.to_string()))
}

fn card_id(word: Option<&str>) -> Result<CardId, CommandError> {
    word.map(CardId::from).ok_or(CommandError::Missing("card id"))
}

impl FromStr for Command {
    type Err = CommandError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let verb = words.next().ok_or(CommandError::Empty)?;
        let command = match verb {
            "add" => match words.next() {
                Some("text") => Command::Add(NewCard::Text),
                Some("chat") => Command::Add(NewCard::Chat),
                Some("video") => Command::Add(NewCard::Video(
                    words.next().ok_or(CommandError::Missing("uri"))?.to_string(),
                )),
                Some("image") => Command::Add(NewCard::Image(
                    words.next().ok_or(CommandError::Missing("uri"))?.to_string(),
                )),
                Some(other) => return Err(CommandError::Unknown(format!("add {other}"))),
                None => return Err(CommandError::Missing("card kind")),
            },
            "move" => Command::Move {
                id: card_id(words.next())?,
                to: Point::new(number(words.next(), "x")?, number(words.next(), "y")?),
            },
            "resize" => Command::Resize {
                id: card_id(words.next())?,
                size: Size::new(number(words.next(), "width")?, number(words.next(), "height")?),
            },
            "trash" => Command::Trash(card_id(words.next())?),
            "capture" => Command::Capture(card_id(words.next())?),
            "release" => Command::Release(number(words.next(), "backpack index")?),
            "cursor" => match words.next() {
                Some("off") => Command::Cursor(None),
                x => Command::Cursor(Some(Point::new(number(x, "x")?, number(words.next(), "y")?))),
            },
            "avatar" => Command::Avatar,
            "say" => {
                let id = card_id(words.next())?;
                let text = words.collect::<Vec<_>>().join(" ");
                if text.is_empty() {
                    return Err(CommandError::Missing("message"));
                }
                Command::Say { id, text }
            }
            "region" => Command::Region(words.next().map(str::to_string)),
            "compact" => Command::Compact,
            "quit" | "exit" => Command::Quit,
            other => return Err(CommandError::Unknown(other.to_string())),
        };
        Ok(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_add() {
        assert_eq!("add text".parse(), Ok(Command::Add(NewCard::Text)));
        assert_eq!(
            "add video https://v".parse(),
            Ok(Command::Add(NewCard::Video("https://v".into())))
        );
        assert_eq!(
            "add image".parse::<Command>(),
            Err(CommandError::Missing("uri"))
        );
    }

    #[test]
    fn test_parse_geometry() {
        assert_eq!(
            "move abc 10 20.5".parse(),
            Ok(Command::Move {
                id: CardId::from("abc"),
                to: Point::new(10.0, 20.5),
            })
        );
        assert_eq!(
            "resize abc 10 x".parse::<Command>(),
            Err(CommandError::BadNumber("x".into()))
        );
        assert_eq!("cursor off".parse(), Ok(Command::Cursor(None)));
        assert_eq!(
            "cursor 1 2".parse(),
            Ok(Command::Cursor(Some(Point::new(1.0, 2.0))))
        );
    }

    #[test]
    fn test_parse_say_joins_words() {
        assert_eq!(
            "say c1 hello   there".parse(),
            Ok(Command::Say {
                id: CardId::from("c1"),
                text: "hello there".into(),
            })
        );
        assert_eq!("say c1".parse::<Command>(), Err(CommandError::Missing("message")));
    }

    #[test]
    fn test_parse_misc() {
        assert_eq!("".parse::<Command>(), Err(CommandError::Empty));
        assert_eq!("release 2".parse(), Ok(Command::Release(2)));
        assert_eq!("region".parse(), Ok(Command::Region(None)));
        assert_eq!(
            "dance".parse::<Command>(),
            Err(CommandError::Unknown("dance".into()))
        );
    }
}
