//! Shell command lines assembled from typed fragments.
//!
//! A [`Command`] is rendered once into the exact string handed to `/bin/sh`,
//! echoed to the audit trail, written to a worker pipe or embedded in a
//! batch script. Rendering is pure: the same fragments always produce the
//! same text, and empty fragments contribute nothing (not even a space).

use std::fmt;
use std::path::Path;

/// Significant digits used for floating point flag values so learned weights
/// survive the trip through text.
pub const FLOAT_PRECISION: usize = 20;

#[derive(Debug, Clone, PartialEq)]
pub enum FlagValue {
    Int(i64),
    Float(f64),
    Text(String),
    Path(String),
    Paths(Vec<String>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Fragment {
    /// Verbatim text such as a program path, `(` or a passthrough option string.
    Word(String),
    Flag {
        name: String,
        value: Option<FlagValue>,
    },
    QuotedPath(String),
    Pipe,
    Redirect(String),
}

impl Fragment {
    fn render_into(&self, out: &mut String) {
        match self {
            Fragment::Word(w) => out.push_str(w.trim()),
            Fragment::Flag { name, value } => {
                out.push_str(name);
                if let Some(value) = value {
                    let rendered = render_value(value);
                    if !rendered.is_empty() {
                        out.push(' ');
                        out.push_str(&rendered);
                    }
                }
            }
            Fragment::QuotedPath(p) => out.push_str(&quote(p)),
            Fragment::Pipe => out.push('|'),
            Fragment::Redirect(target) => {
                out.push_str("> ");
                out.push_str(&quote(target));
            }
        }
    }
}

fn render_value(value: &FlagValue) -> String {
    match value {
        FlagValue::Int(i) => i.to_string(),
        FlagValue::Float(f) => format_g(*f, FLOAT_PRECISION),
        FlagValue::Text(s) => s.trim().to_string(),
        FlagValue::Path(p) => quote(p),
        FlagValue::Paths(ps) => ps.iter().map(|p| quote(p)).collect::<Vec<_>>().join(" "),
    }
}

/// Double-quotes unconditionally so the rendered line does not depend on the
/// path's contents.
pub fn quote(s: &str) -> String {
    format!("\"{}\"", s)
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Command {
    fragments: Vec<Fragment>,
}

impl Command {
    pub fn new(program: impl AsRef<Path>) -> Self {
        let mut cmd = Command::default();
        cmd.fragments
            .push(Fragment::Word(program.as_ref().display().to_string()));
        cmd
    }

    pub fn push(&mut self, fragment: Fragment) -> &mut Self {
        self.fragments.push(fragment);
        self
    }

    pub fn word(mut self, w: impl Into<String>) -> Self {
        self.fragments.push(Fragment::Word(w.into()));
        self
    }

    pub fn flag(mut self, name: impl Into<String>) -> Self {
        self.fragments.push(Fragment::Flag {
            name: name.into(),
            value: None,
        });
        self
    }

    pub fn flag_value(mut self, name: impl Into<String>, value: FlagValue) -> Self {
        self.fragments.push(Fragment::Flag {
            name: name.into(),
            value: Some(value),
        });
        self
    }

    pub fn int(self, name: impl Into<String>, value: i64) -> Self {
        self.flag_value(name, FlagValue::Int(value))
    }

    pub fn float(self, name: impl Into<String>, value: f64) -> Self {
        self.flag_value(name, FlagValue::Float(value))
    }

    pub fn text(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.flag_value(name, FlagValue::Text(value.into()))
    }

    pub fn path(self, name: impl Into<String>, value: impl AsRef<Path>) -> Self {
        self.flag_value(name, FlagValue::Path(value.as_ref().display().to_string()))
    }

    pub fn paths<P: AsRef<Path>>(self, name: impl Into<String>, values: &[P]) -> Self {
        let list = values
            .iter()
            .map(|p| p.as_ref().display().to_string())
            .collect();
        self.flag_value(name, FlagValue::Paths(list))
    }

    pub fn quoted(mut self, value: impl AsRef<Path>) -> Self {
        self.fragments
            .push(Fragment::QuotedPath(value.as_ref().display().to_string()));
        self
    }

    pub fn pipe(mut self) -> Self {
        self.fragments.push(Fragment::Pipe);
        self
    }

    pub fn redirect(mut self, target: impl AsRef<Path>) -> Self {
        self.fragments
            .push(Fragment::Redirect(target.as_ref().display().to_string()));
        self
    }

    /// Appends `fragment` only when present; mirrors the optional flags of
    /// the toolkit invocations.
    pub fn maybe(mut self, fragment: Option<Fragment>) -> Self {
        if let Some(f) = fragment {
            self.fragments.push(f);
        }
        self
    }

    pub fn fragments(&self) -> &[Fragment] {
        &self.fragments
    }

    pub fn render(&self) -> String {
        render(&self.fragments)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

pub fn render(fragments: &[Fragment]) -> String {
    let mut out = String::new();
    let mut piece = String::new();
    for fragment in fragments {
        piece.clear();
        fragment.render_into(&mut piece);
        if piece.is_empty() {
            continue;
        }
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(&piece);
    }
    out
}

/// C `printf("%.{precision}g")`.
pub fn format_g(value: f64, precision: usize) -> String {
    if value.is_nan() {
        return "nan".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    let precision = precision.max(1);
    if value == 0.0 {
        return if value.is_sign_negative() { "-0" } else { "0" }.to_string();
    }

    let sci = format!("{:.*e}", precision - 1, value);
    let (mantissa, exponent) = match sci.split_once('e') {
        Some(parts) => parts,
        None => return sci,
    };
    let exp: i32 = exponent.parse().unwrap_or(0);

    if exp < -4 || exp >= precision as i32 {
        let mantissa = trim_fraction(mantissa);
        let sign = if exp < 0 { '-' } else { '+' };
        format!("{}e{}{:02}", mantissa, sign, exp.abs())
    } else {
        let decimals = (precision as i32 - 1 - exp).max(0) as usize;
        trim_fraction(&format!("{:.*}", decimals, value)).to_string()
    }
}

fn trim_fraction(s: &str) -> &str {
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.')
    } else {
        s
    }
}
