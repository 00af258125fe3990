//! Bencode values as returned by HTTP trackers.

use std::collections::BTreeMap;

use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::take,
    character::complete::{char, digit1},
    combinator::{opt, recognize},
    error::{Error as NomError, ErrorKind},
    multi::many_till,
    sequence::{pair, preceded, terminated},
};
use thiserror::Error;

type ParseResult<'a> = IResult<&'a [u8], Value, NomError<&'a [u8]>>;

/// Lists and dictionaries nested deeper than this are rejected.
pub const MAX_DEPTH: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BencodeError {
    #[error("malformed bencode at byte {0}")]
    Syntax(usize),
    #[error("unexpected end of input")]
    Incomplete,
    #[error("{0} trailing bytes after value")]
    TrailingData(usize),
    #[error("nesting deeper than {MAX_DEPTH} levels")]
    TooDeep,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Bytes(Vec<u8>),
    Integer(i64),
    List(Vec<Value>),
    Dictionary(BTreeMap<Vec<u8>, Value>),
}

impl Value {
    /// Looks up `key` when this is a dictionary.
    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        match self {
            Value::Dictionary(entries) => entries.get(key),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Value::Bytes(bytes) => encode_bytes(bytes, out),
            Value::Integer(value) => out.extend_from_slice(format!("i{value}e").as_bytes()),
            Value::List(items) => {
                out.push(b'l');
                for item in items {
                    item.encode_into(out);
                }
                out.push(b'e');
            }
            Value::Dictionary(entries) => {
                out.push(b'd');
                // BTreeMap iterates keys in the sorted order bencode requires
                for (key, value) in entries {
                    encode_bytes(key, out);
                    value.encode_into(out);
                }
                out.push(b'e');
            }
        }
    }

    fn parse(input: &[u8], depth: usize) -> ParseResult<'_> {
        alt((
            Self::parse_bytes,
            Self::parse_integer,
            |i| Self::parse_list(i, depth),
            |i| Self::parse_dict(i, depth),
        ))
        .parse(input)
    }

    fn check_depth(start: &[u8], depth: usize) -> Result<(), nom::Err<NomError<&[u8]>>> {
        if depth >= MAX_DEPTH {
            return Err(nom::Err::Failure(NomError::new(start, ErrorKind::TooLarge)));
        }
        Ok(())
    }

    fn parse_integer(start: &[u8]) -> ParseResult<'_> {
        let (inp, digits) = terminated(
            preceded(char('i'), recognize(pair(opt(char('-')), digit1))),
            char('e'),
        )
        .parse(start)?;

        // "-0" and leading zeros are not canonical
        let leading_zero = digits.starts_with(b"-0") || (digits[0] == b'0' && digits.len() > 1);
        let value = std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse::<i64>().ok());
        match value {
            Some(value) if !leading_zero => Ok((inp, Value::Integer(value))),
            _ => Err(nom::Err::Failure(NomError::new(start, ErrorKind::Verify))),
        }
    }

    fn parse_bytes(start: &[u8]) -> ParseResult<'_> {
        let (inp, length) = terminated(digit1, char(':')).parse(start)?;
        let length = std::str::from_utf8(length)
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or(nom::Err::Failure(NomError::new(start, ErrorKind::Digit)))?;
        if length > inp.len() {
            // reported with an empty remainder so the caller sees truncation
            let end = &inp[inp.len()..];
            return Err(nom::Err::Failure(NomError::new(end, ErrorKind::Eof)));
        }
        let (inp, bytes) = take(length).parse(inp)?;
        Ok((inp, Value::Bytes(bytes.to_vec())))
    }

    fn parse_list(start: &[u8], depth: usize) -> ParseResult<'_> {
        let (inp, _) = char('l').parse(start)?;
        Self::check_depth(start, depth)?;
        let (inp, (items, _)) =
            many_till(|i| Self::parse(i, depth + 1), char('e')).parse(inp)?;
        Ok((inp, Value::List(items)))
    }

    fn parse_dict(start: &[u8], depth: usize) -> ParseResult<'_> {
        let (inp, _) = char('d').parse(start)?;
        Self::check_depth(start, depth)?;
        let (inp, (entries, _)) = many_till(
            pair(Self::parse_bytes, |i| Self::parse(i, depth + 1)),
            char('e'),
        )
        .parse(inp)?;

        let map = entries
            .into_iter()
            .filter_map(|(key, value)| match key {
                Value::Bytes(key) => Some((key, value)),
                _ => None,
            })
            .collect();
        Ok((inp, Value::Dictionary(map)))
    }
}

fn encode_bytes(bytes: &[u8], out: &mut Vec<u8>) {
    out.extend_from_slice(bytes.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(bytes);
}

/// Decodes exactly one value spanning all of `source`.
pub fn decode(source: &[u8]) -> Result<Value, BencodeError> {
    match Value::parse(source, 0) {
        Ok((rest, value)) if rest.is_empty() => Ok(value),
        Ok((rest, _)) => Err(BencodeError::TrailingData(rest.len())),
        Err(nom::Err::Incomplete(_)) => Err(BencodeError::Incomplete),
        Err(nom::Err::Error(e) | nom::Err::Failure(e)) => {
            if e.code == ErrorKind::TooLarge {
                Err(BencodeError::TooDeep)
            } else if e.input.is_empty() {
                Err(BencodeError::Incomplete)
            } else {
                Err(BencodeError::Syntax(source.len() - e.input.len()))
            }
        }
    }
}
