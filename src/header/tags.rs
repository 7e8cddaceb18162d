//! `[TAG] = value` text blocks shared by the bin header, handle file and hypothesis header.

use std::fmt::{Display, Write as _};
use std::str::FromStr;

use crate::error::Result;
use crate::Error;

pub const END_TAG: &str = "[END OF HEADER]";

#[derive(Debug, Default)]
pub struct TagWriter {
    text: String,
}

impl TagWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one tag line. Line breaks inside the value are flattened to spaces.
    pub fn put(&mut self, tag: &str, value: impl Display) -> &mut Self {
        let value = value.to_string().replace(['\r', '\n'], " ");
        let _ = writeln!(self.text, "[{}] = {}", tag, value);
        self
    }

    pub fn put_opt<T: Display>(&mut self, tag: &str, value: Option<T>) -> &mut Self {
        if let Some(value) = value {
            self.put(tag, value);
        }
        self
    }

    /// Raw line without tag formatting, used for banner lines.
    pub fn line(&mut self, line: &str) -> &mut Self {
        self.text.push_str(line);
        self.text.push('\n');
        self
    }

    pub fn finish(mut self) -> String {
        self.text.push_str(END_TAG);
        self.text.push('\n');
        self.text
    }
}

#[derive(Debug, Default, Clone)]
pub struct Tags {
    entries: Vec<(String, String)>,
    banner: Vec<String>,
}

impl Tags {
    /// Parses tag lines up to `[END OF HEADER]`; untagged lines are kept as banner text.
    pub fn parse(text: &str) -> Self {
        let mut tags = Tags::default();
        for line in text.lines() {
            let line = line.trim_end_matches('\0').trim();
            if line == END_TAG {
                break;
            }
            if line.is_empty() {
                continue;
            }
            match split_tag(line) {
                Some((tag, value)) => tags.entries.push((tag.to_string(), value.to_string())),
                None => tags.banner.push(line.to_string()),
            }
        }
        tags
    }

    pub fn banner(&self) -> &[String] {
        &self.banner
    }

    pub fn get(&self, tag: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(name, _)| name == tag)
            .map(|(_, value)| value.as_str())
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.get(tag).is_some()
    }

    pub fn parsed<T: FromStr>(&self, tag: &str) -> Result<Option<T>> {
        match self.get(tag) {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse::<T>()
                .map(Some)
                .map_err(|_| Error::InvalidHeader(format!("bad value for [{}]: {:?}", tag, raw))),
        }
    }

    pub fn parsed_or<T: FromStr>(&self, tag: &str, default: T) -> Result<T> {
        Ok(self.parsed(tag)?.unwrap_or(default))
    }

    pub fn require<T: FromStr>(&self, tag: &str) -> Result<T> {
        self.parsed(tag)?
            .ok_or_else(|| Error::InvalidHeader(format!("missing [{}]", tag)))
    }

    pub fn string_or(&self, tag: &str, default: &str) -> String {
        self.get(tag).unwrap_or(default).to_string()
    }
}

fn split_tag(line: &str) -> Option<(&str, &str)> {
    let rest = line.strip_prefix('[')?;
    let close = rest.find(']')?;
    let tag = &rest[..close];
    let value = rest[close + 1..].trim_start();
    let value = value.strip_prefix('=').unwrap_or(value).trim();
    Some((tag, value))
}

/// Extracts the numeric version in hundredths from a banner such as `"... library V6.00"`.
pub fn version_hundredths(version: &str) -> Option<u32> {
    let number = version
        .split_whitespace()
        .filter_map(|word| word.strip_prefix('V').or_else(|| word.strip_prefix('v')))
        .chain(version.split_whitespace())
        .find(|word| word.parse::<f64>().is_ok())?;
    let value: f64 = number.parse().ok()?;
    Some((value * 100.0).round() as u32)
}
