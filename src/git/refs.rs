// Copyright © 2022 Kim Altintop <kim@eagain.io>
// SPDX-License-Identifier: GPL-2.0-only WITH openvpn-openssl-exception

use core::{
    fmt,
    ops::Deref,
    str::FromStr,
};

pub const MAX_FILENAME: usize = 255;

#[derive(Clone, Copy)]
pub struct Options {
    pub allow_onelevel: bool,
    pub allow_pattern: bool,
}

pub mod error {
    use thiserror::Error;

    #[derive(Debug, Error)]
    pub enum RefFormat {
        #[error("empty input")]
        Empty,
        #[error("name too long")]
        NameTooLong,
        #[error("invalid character {0:?}")]
        InvalidChar(char),
        #[error("invalid character sequence {0:?}")]
        InvalidSeq(&'static str),
        #[error("must contain at least one '/'")]
        OneLevel,
        #[error("must contain at most one '*'")]
        Pattern,
    }
}

pub fn check_ref_format(opts: Options, s: &str) -> Result<(), error::RefFormat> {
    use error::RefFormat::*;

    match s {
        "" => Err(Empty),
        "@" => Err(InvalidChar('@')),
        "." => Err(InvalidChar('.')),
        _ => {
            let mut globs = 0;
            let mut parts = 0;

            for x in s.split('/') {
                if x.is_empty() {
                    return Err(InvalidSeq("//"));
                }
                if x.len() > MAX_FILENAME {
                    return Err(NameTooLong);
                }

                parts += 1;

                if x.ends_with(".lock") {
                    return Err(InvalidSeq(".lock"));
                }

                let last_char = x.len() - 1;
                for (i, y) in x.chars().zip(x.chars().cycle().skip(1)).enumerate() {
                    match y {
                        ('.', '.') => return Err(InvalidSeq("..")),
                        ('@', '{') => return Err(InvalidSeq("@{")),
                        ('*', _) => globs += 1,
                        (z, _) => match z {
                            '\0' | '\\' | '~' | '^' | ':' | '?' | '[' | ' ' => {
                                return Err(InvalidChar(z))
                            },
                            '.' if i == 0 || i == last_char => return Err(InvalidChar('.')),
                            _ if z.is_ascii_control() => return Err(InvalidChar(z)),

                            _ => continue,
                        },
                    }
                }
            }

            if parts < 2 && !opts.allow_onelevel {
                Err(OneLevel)
            } else if globs > 1 && opts.allow_pattern {
                Err(Pattern)
            } else if globs > 0 && !opts.allow_pattern {
                Err(InvalidChar('*'))
            } else {
                Ok(())
            }
        },
    }
}

/// A valid git refname.
///
/// If the input starts with 'refs/`, it is taken verbatim (after
/// validation), otherwise `refs/heads/' is prepended (ie. the input is
/// considered a branch name).
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Refname(String);

impl Refname {
    /// Refname received over the wire, eg. in a sync update or a push.
    pub fn from_wire(bytes: &[u8]) -> Result<Self, error::RefFormat> {
        core::str::from_utf8(bytes)
            .map_err(|_| error::RefFormat::InvalidSeq("non-utf8"))
            .and_then(Self::from_str)
    }

    /// The final path segment.
    pub fn last_segment(&self) -> &str {
        self.0.rsplit('/').next().expect("refname is never empty")
    }
}

impl fmt::Display for Refname {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self)
    }
}

impl Deref for Refname {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AsRef<str> for Refname {
    fn as_ref(&self) -> &str {
        self
    }
}

impl From<Refname> for String {
    fn from(r: Refname) -> Self {
        r.0
    }
}

impl FromStr for Refname {
    type Err = error::RefFormat;

    fn from_str(s: &str) -> core::result::Result<Self, Self::Err> {
        Self::try_from(s.to_owned())
    }
}

impl TryFrom<String> for Refname {
    type Error = error::RefFormat;

    fn try_from(value: String) -> core::result::Result<Self, Self::Error> {
        const OPTIONS: Options = Options {
            allow_onelevel: true,
            allow_pattern: false,
        };

        check_ref_format(OPTIONS, &value)?;
        let name = if value.starts_with("refs/") {
            value
        } else {
            format!("refs/heads/{}", value)
        };

        Ok(Self(name))
    }
}
