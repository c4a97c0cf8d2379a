// Copyright © 2025 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Parser for `key=value,key=value` option groups such as
//! `--domain name=guest0,memory=256M,cmdline="console=hvc0 quiet"`.
//!
//! Values may be quoted to protect commas, and brackets nest so that list
//! values (`disks=[a,b]`) survive the top level split.

use std::collections::BTreeMap;
use std::str::FromStr;

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum OptionParserError {
    #[error("unknown option: {0}")]
    UnknownOption(String),
    #[error("invalid syntax: {0}")]
    InvalidSyntax(String),
    #[error("unable to convert {1} for {0}")]
    Conversion(String /* option */, String /* value */),
    #[error("missing mandatory option: {0}")]
    MissingOption(String),
}

pub type OptionParserResult<T> = std::result::Result<T, OptionParserError>;

struct OptionValue {
    value: Option<String>,
    requires_value: bool,
}

#[derive(Default)]
pub struct OptionParser {
    options: BTreeMap<String, OptionValue>,
}

fn split_commas(s: &str) -> OptionParserResult<Vec<&str>> {
    let s = s.trim();
    let mut list = Vec::new();
    let mut depth = 0u32;
    let mut in_quotes = false;
    let mut start = 0;

    for (idx, c) in s.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            _ if in_quotes => {}
            '[' => depth += 1,
            ']' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| OptionParserError::InvalidSyntax(s.to_owned()))?;
            }
            ',' if depth == 0 => {
                list.push(&s[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    list.push(&s[start..]);

    if in_quotes || depth != 0 {
        return Err(OptionParserError::InvalidSyntax(s.to_owned()));
    }

    Ok(list)
}

/// Strip quoting. A doubled quote outside of a quoted section stands for a
/// literal quote character.
fn dequote(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_quotes = false;
    let mut prev = '\0';
    for c in s.chars() {
        if c == '"' {
            if prev == '"' && !in_quotes {
                out.push('"');
            }
            in_quotes = !in_quotes;
        } else {
            out.push(c);
        }
        prev = c;
    }
    out
}

impl OptionParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, option: &str) -> &mut Self {
        self.insert(option, true)
    }

    pub fn add_valueless(&mut self, option: &str) -> &mut Self {
        self.insert(option, false)
    }

    fn insert(&mut self, option: &str, requires_value: bool) -> &mut Self {
        assert!(
            !option.contains(['"', '[', ']', '=', ',']),
            "forbidden character in option name"
        );
        self.options.insert(
            option.to_owned(),
            OptionValue {
                value: None,
                requires_value,
            },
        );
        self
    }

    pub fn parse(&mut self, input: &str) -> OptionParserResult<()> {
        if input.trim().is_empty() {
            return Ok(());
        }

        for option in split_commas(input)? {
            let (name, value) = match option.split_once('=') {
                Some((name, value)) => (name.trim(), Some(value.trim())),
                None => (option.trim(), None),
            };
            let entry = self
                .options
                .get_mut(name)
                .ok_or_else(|| OptionParserError::UnknownOption(name.to_owned()))?;

            entry.value = match (entry.requires_value, value) {
                (true, Some(value)) => Some(value.to_owned()),
                (true, None) => return Err(OptionParserError::InvalidSyntax(option.to_owned())),
                (false, _) => Some(String::new()),
            };
        }

        Ok(())
    }

    pub fn is_set(&self, option: &str) -> bool {
        self.options
            .get(option)
            .is_some_and(|entry| entry.value.is_some())
    }

    /// Dequoted value of `option`, `None` when unset or empty.
    pub fn get(&self, option: &str) -> Option<String> {
        self.options
            .get(option)
            .and_then(|entry| entry.value.as_deref())
            .filter(|v| !v.is_empty())
            .map(dequote)
    }

    pub fn require(&self, option: &str) -> OptionParserResult<String> {
        self.get(option)
            .ok_or_else(|| OptionParserError::MissingOption(option.to_owned()))
    }

    pub fn convert<T: FromStr>(&self, option: &str) -> OptionParserResult<Option<T>> {
        match self.get(option) {
            None => Ok(None),
            Some(v) => v
                .parse()
                .map(Some)
                .map_err(|_| OptionParserError::Conversion(option.to_owned(), v)),
        }
    }
}

/// Byte count with an optional `K`, `M` or `G` suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteSized(pub u64);

#[derive(Error, Debug)]
pub enum ByteSizedParseError {
    #[error("invalid value: {0}")]
    InvalidValue(String),
}

impl FromStr for ByteSized {
    type Err = ByteSizedParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (digits, shift) = match s.char_indices().last() {
            Some((idx, 'K')) => (&s[..idx], 10),
            Some((idx, 'M')) => (&s[..idx], 20),
            Some((idx, 'G')) => (&s[..idx], 30),
            _ => (s, 0),
        };
        let value = digits
            .parse::<u64>()
            .map_err(|_| ByteSizedParseError::InvalidValue(s.to_owned()))?;

        value
            .checked_mul(1 << shift)
            .map(ByteSized)
            .ok_or_else(|| ByteSizedParseError::InvalidValue(s.to_owned()))
    }
}
