//! Clock-quality aggregation (spec §4.6): a sliding window of recent
//! `DataPoint`s (PHC offset, oscillator offset, oscillator class) reduced
//! by two operator-editable expressions into a `ClockAccuracy` /
//! `ClockClass` pair, with per-class baseline flooring so a momentarily
//! tight measurement during holdover can't advertise better quality than
//! the class allows.

use crate::error::{PtpdiscError, Result as PtpdiscResult};
use crate::ringbuffer::RingBuffer;
use serde::Deserialize;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpStream};
use std::time::Duration;

/// PTP `clockClass` values this aggregator can derive. Not the full IEEE
/// 1588 table -- just the states an oscillator status probe can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockClass {
    Locked,
    Calibrating,
    Holdover,
    Uncalibrated,
}

impl ClockClass {
    fn from_code(code: u8) -> ClockClass {
        match code {
            6 => ClockClass::Locked,
            7 => ClockClass::Calibrating,
            140 => ClockClass::Holdover,
            _ => ClockClass::Uncalibrated,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            ClockClass::Locked => 6,
            ClockClass::Calibrating => 7,
            ClockClass::Holdover => 140,
            ClockClass::Uncalibrated => 248,
        }
    }
}

/// PTP `clockAccuracy` buckets (IEEE 1588 Table 5), ordered finest
/// first. `bucket_for_ns` picks the coarsest bucket that still covers a
/// given offset, i.e. the first threshold the offset does not exceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ClockAccuracy {
    Ns25,
    Ns100,
    Ns250,
    Us1,
    Us2_5,
    Us10,
    Us25,
    Us100,
    Us250,
    Ms1,
    Ms2_5,
    Ms10,
    Ms25,
    Ms100,
    Ms250,
    S1,
    S10,
    GreaterThan10s,
    Unknown,
}

const ACCURACY_LADDER: &[(ClockAccuracy, f64)] = &[
    (ClockAccuracy::Ns25, 25.0),
    (ClockAccuracy::Ns100, 100.0),
    (ClockAccuracy::Ns250, 250.0),
    (ClockAccuracy::Us1, 1_000.0),
    (ClockAccuracy::Us2_5, 2_500.0),
    (ClockAccuracy::Us10, 10_000.0),
    (ClockAccuracy::Us25, 25_000.0),
    (ClockAccuracy::Us100, 100_000.0),
    (ClockAccuracy::Us250, 250_000.0),
    (ClockAccuracy::Ms1, 1_000_000.0),
    (ClockAccuracy::Ms2_5, 2_500_000.0),
    (ClockAccuracy::Ms10, 10_000_000.0),
    (ClockAccuracy::Ms25, 25_000_000.0),
    (ClockAccuracy::Ms100, 100_000_000.0),
    (ClockAccuracy::Ms250, 250_000_000.0),
    (ClockAccuracy::S1, 1_000_000_000.0),
    (ClockAccuracy::S10, 10_000_000_000.0),
];

impl ClockAccuracy {
    /// Coarsest bucket covering an offset of `abs_ns` nanoseconds.
    pub fn bucket_for_ns(abs_ns: f64) -> ClockAccuracy {
        let abs_ns = abs_ns.abs();
        for (bucket, max_ns) in ACCURACY_LADDER {
            if abs_ns <= *max_ns {
                return *bucket;
            }
        }
        ClockAccuracy::GreaterThan10s
    }

    /// IEEE 1588 Table 5 `clockAccuracy` enumeration codes.
    pub fn code(self) -> u8 {
        match self {
            ClockAccuracy::Ns25 => 0x20,
            ClockAccuracy::Ns100 => 0x21,
            ClockAccuracy::Ns250 => 0x22,
            ClockAccuracy::Us1 => 0x23,
            ClockAccuracy::Us2_5 => 0x24,
            ClockAccuracy::Us10 => 0x25,
            ClockAccuracy::Us25 => 0x26,
            ClockAccuracy::Us100 => 0x27,
            ClockAccuracy::Us250 => 0x28,
            ClockAccuracy::Ms1 => 0x29,
            ClockAccuracy::Ms2_5 => 0x2a,
            ClockAccuracy::Ms10 => 0x2b,
            ClockAccuracy::Ms25 => 0x2c,
            ClockAccuracy::Ms100 => 0x2d,
            ClockAccuracy::Ms250 => 0x2e,
            ClockAccuracy::S1 => 0x2f,
            ClockAccuracy::S10 => 0x30,
            ClockAccuracy::GreaterThan10s => 0x31,
            ClockAccuracy::Unknown => 0xfe,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DataPoint {
    pub phc_offset_ns: i64,
    pub osc_offset_ns: i64,
    pub osc_class: ClockClass,
}

/// Per-class floors applied after expression evaluation (§4.6 "Output
/// derivation" step 4).
#[derive(Debug, Clone, Copy)]
pub struct Baselines {
    pub lock: ClockAccuracy,
    pub holdover: ClockAccuracy,
    pub calibrating: ClockAccuracy,
}

impl Default for Baselines {
    fn default() -> Self {
        Baselines {
            lock: ClockAccuracy::Ns100,
            holdover: ClockAccuracy::Us100,
            calibrating: ClockAccuracy::Ms1,
        }
    }
}

pub struct QualityOutput {
    pub accuracy: ClockAccuracy,
    pub class: ClockClass,
}

pub struct Aggregator {
    window: RingBuffer<DataPoint>,
    baselines: Baselines,
}

impl Aggregator {
    pub fn new(window_size: usize) -> Self {
        Aggregator::with_baselines(window_size, Baselines::default())
    }

    pub fn with_baselines(window_size: usize, baselines: Baselines) -> Self {
        Aggregator { window: RingBuffer::new(window_size), baselines }
    }

    pub fn record(&mut self, point: DataPoint) {
        self.window.push(point);
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    fn series(&self) -> HashMap<&'static str, Vec<f64>> {
        let points: Vec<DataPoint> = self.window.iter_oldest_first().copied().collect();
        let mut vars = HashMap::new();
        vars.insert("phcoffset", points.iter().map(|p| p.phc_offset_ns as f64).collect());
        vars.insert("oscillatoroffset", points.iter().map(|p| p.osc_offset_ns as f64).collect());
        vars.insert("oscillatorclass", points.iter().map(|p| p.osc_class.code() as f64).collect());
        vars
    }

    /// Evaluate the accuracy and class expressions and apply per-class
    /// baseline flooring. `None` if the window has no recorded points yet
    /// (§4.6 "Output derivation" step 1).
    pub fn evaluate(&self, accuracy_expr: &str, class_expr: &str) -> crate::error::Result<Option<QualityOutput>> {
        if self.is_empty() {
            return Ok(None);
        }
        let vars = self.series();
        let accuracy_ns = evaluate_expression(accuracy_expr, &vars)?;
        let class_code = evaluate_expression(class_expr, &vars)?;
        let class = ClockClass::from_code(class_code.round().clamp(0.0, 255.0) as u8);
        let mut accuracy = ClockAccuracy::bucket_for_ns(accuracy_ns);

        accuracy = match class {
            ClockClass::Uncalibrated => ClockAccuracy::Unknown,
            ClockClass::Holdover if accuracy < self.baselines.holdover => self.baselines.holdover,
            ClockClass::Locked if accuracy < self.baselines.lock => self.baselines.lock,
            ClockClass::Calibrating if accuracy < self.baselines.calibrating => self.baselines.calibrating,
            _ => accuracy,
        };

        Ok(Some(QualityOutput { accuracy, class }))
    }
}

/// A minimal arithmetic expression language over the three PTP-quality
/// vectors (`phcoffset`, `oscillatoroffset`, `oscillatorclass`) and the
/// closed reducer set `abs`, `max`, `mean`, `variance`, `stddev`, `p99`
/// (spec §9 DESIGN NOTES). Any identifier outside that set is rejected.
#[derive(Debug, Clone)]
enum Value {
    Scalar(f64),
    Vector(Vec<f64>),
}

impl Value {
    fn as_scalar(&self, expr: &str) -> crate::error::Result<f64> {
        match self {
            Value::Scalar(v) => Ok(*v),
            Value::Vector(_) => Err(crate::error::PtpdiscError::Config(format!(
                "expression does not reduce to a scalar: {expr}"
            ))),
        }
    }
}

pub fn evaluate_expression(expr: &str, vars: &HashMap<&'static str, Vec<f64>>) -> crate::error::Result<f64> {
    let tokens = tokenize(expr)?;
    let mut parser = ExprParser { tokens: &tokens, pos: 0, vars };
    let value = parser.parse_expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(crate::error::PtpdiscError::Config(format!("trailing tokens in expression: {expr}")));
    }
    value.as_scalar(expr)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
}

fn tokenize(expr: &str) -> crate::error::Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = expr.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' => i += 1,
            '+' => { tokens.push(Token::Plus); i += 1; }
            '-' => { tokens.push(Token::Minus); i += 1; }
            '*' => { tokens.push(Token::Star); i += 1; }
            '/' => { tokens.push(Token::Slash); i += 1; }
            '(' => { tokens.push(Token::LParen); i += 1; }
            ')' => { tokens.push(Token::RParen); i += 1; }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let value = text
                    .parse::<f64>()
                    .map_err(|_| crate::error::PtpdiscError::Config(format!("bad numeric literal: {text}")))?;
                tokens.push(Token::Number(value));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                tokens.push(Token::Ident(text));
            }
            other => {
                return Err(crate::error::PtpdiscError::Config(format!(
                    "unexpected character '{other}' in expression"
                )))
            }
        }
    }
    Ok(tokens)
}

struct ExprParser<'a> {
    tokens: &'a [Token],
    pos: usize,
    vars: &'a HashMap<&'static str, Vec<f64>>,
}

impl<'a> ExprParser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn parse_expr(&mut self) -> crate::error::Result<Value> {
        let mut value = self.parse_term()?.as_scalar("")?;
        loop {
            match self.peek() {
                Some(Token::Plus) => { self.pos += 1; value += self.parse_term()?.as_scalar("")?; }
                Some(Token::Minus) => { self.pos += 1; value -= self.parse_term()?.as_scalar("")?; }
                _ => break,
            }
        }
        Ok(Value::Scalar(value))
    }

    fn parse_term(&mut self) -> crate::error::Result<Value> {
        let mut value = self.parse_factor()?.as_scalar("")?;
        loop {
            match self.peek() {
                Some(Token::Star) => { self.pos += 1; value *= self.parse_factor()?.as_scalar("")?; }
                Some(Token::Slash) => {
                    self.pos += 1;
                    let divisor = self.parse_factor()?.as_scalar("")?;
                    if divisor == 0.0 {
                        return Err(crate::error::PtpdiscError::Config("division by zero".into()));
                    }
                    value /= divisor;
                }
                _ => break,
            }
        }
        Ok(Value::Scalar(value))
    }

    fn parse_factor(&mut self) -> crate::error::Result<Value> {
        match self.peek().cloned() {
            Some(Token::Minus) => {
                self.pos += 1;
                Ok(Value::Scalar(-self.parse_factor()?.as_scalar("")?))
            }
            Some(Token::Number(n)) => {
                self.pos += 1;
                Ok(Value::Scalar(n))
            }
            Some(Token::Ident(name)) => {
                self.pos += 1;
                if self.peek() == Some(&Token::LParen) {
                    self.pos += 1;
                    let arg = self.parse_funcarg()?;
                    match self.peek() {
                        Some(Token::RParen) => self.pos += 1,
                        _ => return Err(crate::error::PtpdiscError::Config("expected closing paren".into())),
                    }
                    apply_function(&name, arg)
                } else {
                    match self.vars.get(name.as_str()) {
                        Some(series) => Ok(Value::Vector(series.clone())),
                        None => Err(crate::error::PtpdiscError::Config(format!("unknown identifier: {name}"))),
                    }
                }
            }
            Some(Token::LParen) => {
                self.pos += 1;
                let value = self.parse_expr()?;
                match self.peek() {
                    Some(Token::RParen) => { self.pos += 1; Ok(value) }
                    _ => Err(crate::error::PtpdiscError::Config("expected closing paren".into())),
                }
            }
            other => Err(crate::error::PtpdiscError::Config(format!(
                "unexpected token in expression: {other:?}"
            ))),
        }
    }

    /// A function argument is either a bare named vector or a nested
    /// function call (`abs(phcoffset)`, `max(abs(phcoffset))`, ...).
    fn parse_funcarg(&mut self) -> crate::error::Result<Value> {
        match self.peek().cloned() {
            Some(Token::Ident(name)) => {
                self.pos += 1;
                if self.peek() == Some(&Token::LParen) {
                    self.pos += 1;
                    let inner = self.parse_funcarg()?;
                    match self.peek() {
                        Some(Token::RParen) => self.pos += 1,
                        _ => return Err(crate::error::PtpdiscError::Config("expected closing paren".into())),
                    }
                    apply_function(&name, inner)
                } else {
                    self.vars
                        .get(name.as_str())
                        .map(|s| Value::Vector(s.clone()))
                        .ok_or_else(|| crate::error::PtpdiscError::Config(format!("unknown identifier: {name}")))
                }
            }
            _ => Err(crate::error::PtpdiscError::Config("expected a vector identifier".into())),
        }
    }
}

fn apply_function(name: &str, arg: Value) -> crate::error::Result<Value> {
    match name {
        "abs" => Ok(match arg {
            Value::Scalar(v) => Value::Scalar(v.abs()),
            Value::Vector(v) => Value::Vector(v.into_iter().map(f64::abs).collect()),
        }),
        "max" => Ok(Value::Scalar(reduce(&arg, |v| v.iter().cloned().fold(f64::MIN, f64::max)))),
        "mean" => Ok(Value::Scalar(reduce(&arg, mean))),
        "variance" => Ok(Value::Scalar(reduce(&arg, variance))),
        "stddev" => Ok(Value::Scalar(reduce(&arg, |v| variance(v).sqrt()))),
        "p99" => Ok(Value::Scalar(reduce(&arg, p99))),
        other => Err(crate::error::PtpdiscError::Config(format!("unknown function: {other}"))),
    }
}

fn reduce(value: &Value, f: impl Fn(&[f64]) -> f64) -> f64 {
    match value {
        Value::Scalar(v) => *v,
        Value::Vector(v) => {
            if v.is_empty() {
                0.0
            } else {
                f(v)
            }
        }
    }
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

fn variance(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64
}

fn p99(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let rank = ((0.99 * sorted.len() as f64).ceil() as usize).saturating_sub(1).min(sorted.len() - 1);
    sorted[rank]
}

const OSCILLATORD_PORT: u16 = 2958;
const OSCILLATORD_READ_LIMIT: usize = 1000;
const OSCILLATORD_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Deserialize)]
struct OscillatordReply {
    #[serde(default)]
    clock: OscillatordClock,
}

#[derive(Debug, Default, Deserialize)]
struct OscillatordClock {
    #[serde(default)]
    class: u8,
    #[serde(default)]
    offset: i64,
}

/// One reading from an `oscillatord` monitoring socket (spec §6): connect
/// to localhost:2958, send `{}`, and parse the `clock.class`/`clock.offset`
/// fields out of the JSON status reply.
pub fn probe_oscillatord() -> PtpdiscResult<(ClockClass, i64)> {
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), OSCILLATORD_PORT);
    let mut stream = TcpStream::connect_timeout(&addr, OSCILLATORD_TIMEOUT)
        .map_err(|e| PtpdiscError::Transport(format!("connecting to oscillatord: {e}")))?;
    stream
        .set_read_timeout(Some(OSCILLATORD_TIMEOUT))
        .map_err(|e| PtpdiscError::Transport(format!("setting oscillatord read timeout: {e}")))?;
    stream
        .write_all(b"{}")
        .map_err(|e| PtpdiscError::Transport(format!("sending oscillatord request: {e}")))?;

    let mut buf = vec![0u8; OSCILLATORD_READ_LIMIT];
    let n = stream
        .read(&mut buf)
        .map_err(|e| PtpdiscError::Transport(format!("reading oscillatord reply: {e}")))?;
    let reply: OscillatordReply = serde_json::from_slice(&buf[..n])
        .map_err(|e| PtpdiscError::Transport(format!("parsing oscillatord reply: {e}")))?;

    let class = if reply.clock.class == 0 { ClockClass::Uncalibrated } else { ClockClass::from_code(reply.clock.class) };
    Ok((class, reply.clock.offset))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_aggregator() -> Aggregator {
        let mut agg = Aggregator::new(8);
        for (phc, osc, class) in [
            (100i64, 10i64, ClockClass::Locked),
            (-100, -10, ClockClass::Locked),
            (150, 15, ClockClass::Locked),
            (-120, -12, ClockClass::Locked),
        ] {
            agg.record(DataPoint { phc_offset_ns: phc, osc_offset_ns: osc, osc_class: class });
        }
        agg
    }

    #[test]
    fn empty_window_produces_no_output() {
        let agg = Aggregator::new(8);
        assert!(agg.evaluate("mean(phcoffset)", "6").unwrap().is_none());
    }

    #[test]
    fn oscillatord_reply_parses_clock_fields() {
        let json = br#"{"oscillator":{"model":"sa3x","lock":true},"clock":{"class":6,"offset":-42}}"#;
        let reply: OscillatordReply = serde_json::from_slice(json).unwrap();
        assert_eq!(reply.clock.class, 6);
        assert_eq!(reply.clock.offset, -42);
    }

    #[test]
    fn oscillatord_reply_defaults_missing_clock_to_uncalibrated() {
        let reply: OscillatordReply = serde_json::from_slice(b"{}").unwrap();
        assert_eq!(reply.clock.class, 0);
    }

    #[test]
    fn evaluates_vector_functions_over_recorded_series() {
        let agg = sample_aggregator();
        let out = agg.evaluate("max(abs(phcoffset))", "6").unwrap().unwrap();
        assert_eq!(out.accuracy, ClockAccuracy::bucket_for_ns(150.0));
        assert_eq!(out.class, ClockClass::Locked);
    }

    #[test]
    fn unknown_identifier_is_an_error() {
        let agg = sample_aggregator();
        assert!(agg.evaluate("mean(bogus)", "6").is_err());
    }

    #[test]
    fn bare_vector_expression_is_not_a_scalar() {
        let agg = sample_aggregator();
        assert!(agg.evaluate("phcoffset", "6").is_err());
    }

    #[test]
    fn accuracy_ladder_picks_coarsest_covering_bucket() {
        assert_eq!(ClockAccuracy::bucket_for_ns(10.0), ClockAccuracy::Ns25);
        assert_eq!(ClockAccuracy::bucket_for_ns(90.0), ClockAccuracy::Ns100);
        assert_eq!(ClockAccuracy::bucket_for_ns(50_000_000_000.0), ClockAccuracy::GreaterThan10s);
    }

    #[test]
    fn holdover_floors_accuracy_to_baseline() {
        let agg = sample_aggregator();
        // ClockClass code 140 == Holdover; a tight measured offset must
        // not be reported as better than the holdover baseline.
        let out = agg.evaluate("max(abs(phcoffset))", "140").unwrap().unwrap();
        assert_eq!(out.class, ClockClass::Holdover);
        assert_eq!(out.accuracy, Baselines::default().holdover);
    }

    #[test]
    fn uncalibrated_class_forces_unknown_accuracy() {
        let agg = sample_aggregator();
        let out = agg.evaluate("max(abs(phcoffset))", "1").unwrap().unwrap();
        assert_eq!(out.class, ClockClass::Uncalibrated);
        assert_eq!(out.accuracy, ClockAccuracy::Unknown);
    }

    #[test]
    fn p99_of_small_series_is_the_max() {
        assert_eq!(p99(&[1.0, 2.0, 3.0]), 3.0);
    }
}
