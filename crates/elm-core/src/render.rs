//! Response rendering
//!
//! Turns a response template into the exact characters the adapter prints,
//! using the formatting options currently held in the session counters.

use regex::Regex;
use tracing::{debug, error, warn};

use crate::counters::{keys, CounterValue, Counters};
use crate::expr::{self, Locals};
use crate::template::{Tag, Template};
use crate::uds::{self, FrameKind, Framing};

/// Adapter prompt
pub const PROMPT: &str = ">";

/// Reply for a template that could not be rendered
pub const NO_DATA: &str = "NO DATA";

/// Chunks written to the tester, in order
#[derive(Debug, Default, Clone)]
pub struct Outbox {
    chunks: Vec<String>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: impl Into<String>) {
        let chunk = chunk.into();
        if !chunk.is_empty() {
            self.chunks.push(chunk);
        }
    }

    pub fn chunks(&self) -> &[String] {
        &self.chunks
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn take(&mut self) -> Vec<String> {
        std::mem::take(&mut self.chunks)
    }
}

/// Output style derived from the counters on every render
#[derive(Debug, Clone)]
pub struct Style {
    /// Byte separator (ATS)
    pub sp: &'static str,
    /// Line terminator (ATL)
    pub nl: &'static str,
    /// Linefeed modes 3..=5 print the prompt without a terminator
    pub inline_prompt: bool,
    /// Header echo (ATH)
    pub echo_header: bool,
    /// Receive address filter (ATCRA)
    pub cra: Option<Regex>,
}

impl Style {
    pub fn from_counters(counters: &Counters) -> Self {
        let sp = match counters.get(keys::SPACES) {
            Some(CounterValue::Bool(false)) | Some(CounterValue::Int(0)) => "",
            Some(CounterValue::Float(f)) if *f == 0.0 => "",
            _ => " ",
        };

        let linefeeds = counters.get(keys::LINEFEEDS);
        let mode = linefeeds.and_then(CounterValue::as_int);
        let nl = match mode {
            None if linefeeds.is_none() => "\r",
            Some(0) | Some(3) => "\r",
            Some(1) | Some(4) => "\r\n",
            Some(2) | Some(5) => "\n",
            _ => {
                error!(value = ?linefeeds, "Invalid \"{}\" value", keys::LINEFEEDS);
                "\r"
            }
        };

        let cra = counters
            .get(keys::CRA)
            .filter(|v| v.is_truthy())
            .map(|v| v.to_string())
            .and_then(|filter| {
                let pattern = format!("^{}$", filter.replace('X', ".").replace('x', "?"));
                match Regex::new(&pattern) {
                    Ok(re) => Some(re),
                    Err(e) => {
                        error!(%filter, %e, "Invalid receive address filter");
                        None
                    }
                }
            });

        Self {
            sp,
            nl,
            inline_prompt: mode.map(|m| m > 2).unwrap_or(false),
            echo_header: counters.flag(keys::USE_HEADER, false),
            cra,
        }
    }

    fn framing(&self) -> Framing<'static> {
        Framing {
            echo_header: self.echo_header,
            sp: self.sp,
        }
    }

    fn accepts(&self, header: &str) -> bool {
        self.cra.as_ref().map(|re| re.is_match(header)).unwrap_or(true)
    }
}

/// Renders templates against one session
pub struct Renderer<'a> {
    counters: &'a mut Counters,
    out: &'a mut Outbox,
}

impl<'a> Renderer<'a> {
    pub fn new(counters: &'a mut Counters, out: &'a mut Outbox) -> Self {
        Self { counters, out }
    }

    /// Render `template` and write it to the outbox
    ///
    /// Returns the final chunk written, `None` when the template produces
    /// no output.
    pub fn render(
        &mut self,
        template: &str,
        request_header: Option<&str>,
        request_data: Option<&str>,
    ) -> Option<String> {
        debug!(template, "Processing response");
        let style = Style::from_counters(self.counters);

        let mut request_header = request_header.map(str::to_string);
        let mut request_data = request_data.map(str::to_string);
        let mut answer = String::new();
        let mut incomplete = false;
        let mut header_seen = false;

        match Template::parse(template) {
            Err(e) => {
                error!(template, %e, "Wrong response format");
                incomplete = true;
            }
            Ok(parsed) => {
                answer.push_str(&parsed.leading);
                let mut elements = parsed.elements.iter();
                while let Some(element) = elements.next() {
                    let mut tail = &element.tail;
                    match element.tag {
                        Tag::Rh => request_header = Some(element.text.clone()),
                        Tag::Rd => request_data = Some(element.text.clone()),
                        Tag::String => answer.push_str(&element.text),
                        Tag::Writeln => {
                            answer.push_str(&element.text);
                            answer.push_str(style.nl);
                        }
                        Tag::Space => {
                            answer.push_str(&element.text);
                            answer.push_str(style.sp);
                        }
                        Tag::Eval | Tag::Exec => {
                            if element.tag == Tag::Exec {
                                debug!(chunk = ?answer, "Write");
                                self.out.push(std::mem::take(&mut answer));
                            }
                            let value = self.evaluate(&element.text, request_header.as_deref(), request_data.as_deref());
                            if element.tag == Tag::Eval {
                                if let Some(value) = value {
                                    answer.push_str(&value);
                                }
                            }
                        }
                        Tag::Answer | Tag::Flow => {
                            let kind = if element.tag == Tag::Flow {
                                FrameKind::Flow
                            } else {
                                FrameKind::Answer
                            };
                            let frame = self.encode(&style, request_header.as_deref(), &element.text, kind);
                            push_frame(&mut answer, &frame, &style);
                        }
                        Tag::PosAnswer | Tag::NegAnswer => {
                            let Some(request) = request_data.as_deref().filter(|r| !r.is_empty()) else {
                                error!(template, "Missing request with <{:?}> tag", element.tag);
                                break;
                            };
                            let data = if element.tag == Tag::PosAnswer {
                                uds::positive_response(request, &element.text)
                            } else {
                                uds::negative_response(request, &element.text)
                            };
                            let data = match data {
                                Ok(data) => data,
                                Err(e) => {
                                    error!(request, template, %e, "Invalid request for UDS answer");
                                    return None;
                                }
                            };
                            let frame = self.encode(&style, request_header.as_deref(), &data, FrameKind::Answer);
                            push_frame(&mut answer, &frame, &style);
                        }
                        Tag::Header => {
                            header_seen = true;
                            incomplete = true;
                            let (Some(size), Some(data)) = (elements.next(), elements.next()) else {
                                error!(template, "Missing <size> or <data>/<subd> tags after <header> tag");
                                break;
                            };
                            if size.tag != Tag::Size || !matches!(data.tag, Tag::Data | Tag::Subd) {
                                error!(template, "<size> and <data>/<subd> tags must follow the <header> tag");
                                break;
                            }
                            let Ok(declared) = usize::from_str_radix(size.text.trim(), 16) else {
                                error!(size = %size.text, template, "Improper size");
                                break;
                            };
                            if data.text.is_empty() {
                                error!(template, "Missing data for response");
                                break;
                            }
                            let unspaced: String = data.text.chars().filter(|c| !c.is_whitespace()).collect();
                            if declared < 16 && unspaced.len() != declared * 2 {
                                error!(
                                    data = %data.text,
                                    size = %size.text,
                                    template,
                                    "Mismatch between number of data digits and related length field"
                                );
                                break;
                            }
                            incomplete = false;
                            if style.accepts(&element.text) {
                                if style.echo_header {
                                    answer.push_str(&element.text);
                                    answer.push_str(style.sp);
                                    answer.push_str(&size.text);
                                    answer.push_str(style.sp);
                                }
                                if style.sp.is_empty() {
                                    answer.push_str(&unspaced);
                                } else {
                                    answer.push_str(&data.text);
                                }
                                answer.push_str(style.sp);
                                if data.tag == Tag::Data {
                                    answer.push_str(style.nl);
                                }
                            }
                            tail = &data.tail;
                        }
                        Tag::Size | Tag::Data | Tag::Subd => {
                            warn!(template, "Ignoring <{:?}> tag outside a <header> group", element.tag);
                        }
                    }
                    answer.push_str(tail);
                }
            }
        }

        if incomplete || (header_seen && answer.is_empty()) {
            answer = format!("{}{}", NO_DATA, style.nl);
        }
        if answer.is_empty() {
            debug!(template, "Null response");
            return None;
        }
        if !style.inline_prompt {
            answer.push_str(style.nl);
        }
        answer.push_str(PROMPT);
        debug!(chunk = ?answer, "Write");
        self.out.push(answer.clone());
        Some(answer)
    }

    fn evaluate(&mut self, expression: &str, request_header: Option<&str>, request_data: Option<&str>) -> Option<String> {
        let expression = expression.trim();
        if expression.is_empty() {
            debug!("Missing expression to evaluate");
            return None;
        }
        let mut locals = Locals::new();
        if let Some(header) = request_header {
            locals = locals.with("request_header", header);
        }
        if let Some(data) = request_data {
            locals = locals.with("request_data", data);
        }
        match expr::evaluate(expression, self.counters, &locals) {
            Ok(value) => {
                debug!(expression, ?value, "Evaluated expression");
                value
            }
            Err(e) => {
                error!(%e, "Cannot evaluate expression");
                None
            }
        }
    }

    fn encode(&self, style: &Style, request_header: Option<&str>, data: &str, kind: FrameKind) -> String {
        let header = request_header
            .map(str::to_string)
            .or_else(|| self.counters.string(keys::SET_HEADER))
            .unwrap_or_default();
        match uds::encode(&header, data, kind, style.framing()) {
            Ok(frame) => frame,
            Err(e) => {
                error!(header = %header, data, %e, "Cannot encode UDS answer");
                String::new()
            }
        }
    }
}

fn push_frame(answer: &mut String, frame: &str, style: &Style) {
    answer.push_str(frame);
    answer.push_str(style.sp);
    answer.push_str(style.nl);
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn render(counters: &mut Counters, template: &str, header: Option<&str>, data: Option<&str>) -> (Option<String>, Vec<String>) {
        let mut out = Outbox::new();
        let result = Renderer::new(counters, &mut out).render(template, header, data);
        (result, out.take())
    }

    #[test]
    fn test_writeln_and_prompt() {
        let mut counters = Counters::new();
        let (result, chunks) = render(&mut counters, "<writeln>OK</writeln>", None, None);
        assert_eq!(result.as_deref(), Some("OK\r\r>"));
        assert_eq!(chunks, vec!["OK\r\r>".to_string()]);
    }

    #[test]
    fn test_linefeed_modes() {
        let mut counters = Counters::new();
        counters.set(keys::LINEFEEDS, 1i64);
        let (result, _) = render(&mut counters, "<writeln>OK</writeln>", None, None);
        assert_eq!(result.as_deref(), Some("OK\r\n\r\n>"));

        counters.set(keys::LINEFEEDS, 5i64);
        let (result, _) = render(&mut counters, "<writeln>OK</writeln>", None, None);
        assert_eq!(result.as_deref(), Some("OK\n>"));
    }

    #[test]
    fn test_empty_template_is_silent() {
        let mut counters = Counters::new();
        let (result, chunks) = render(&mut counters, "", None, None);
        assert_eq!(result, None);
        assert!(chunks.is_empty());
    }

    #[test]
    fn test_malformed_template_no_data() {
        let mut counters = Counters::new();
        let (result, _) = render(&mut counters, "<bogus>1</bogus>", None, None);
        assert_eq!(result.as_deref(), Some("NO DATA\r\r>"));
    }

    #[test]
    fn test_header_triple() {
        let mut counters = Counters::new();
        let template = "<header>7E8</header><size>06</size><data>41 00 BE 3F A8 13</data>";
        let (result, _) = render(&mut counters, template, None, None);
        assert_eq!(result.as_deref(), Some("41 00 BE 3F A8 13 \r\r>"));

        counters.set(keys::USE_HEADER, true);
        counters.set(keys::SPACES, 0i64);
        let (result, _) = render(&mut counters, template, None, None);
        assert_eq!(result.as_deref(), Some("7E8064100BE3FA813\r\r>"));
    }

    #[test]
    fn test_header_triple_size_mismatch() {
        let mut counters = Counters::new();
        let (result, _) = render(&mut counters, "<header>7E8</header><size>03</size><data>41 00</data>", None, None);
        assert_eq!(result.as_deref(), Some("NO DATA\r\r>"));
    }

    #[test]
    fn test_cra_filter() {
        let mut counters = Counters::new();
        counters.set(keys::CRA, "7E9");
        let template = "<header>7E8</header><size>02</size><data>41 00</data>";
        let (result, _) = render(&mut counters, template, None, None);
        assert_eq!(result.as_deref(), Some("NO DATA\r\r>"));

        counters.set(keys::CRA, "7EX");
        let (result, _) = render(&mut counters, template, None, None);
        assert_eq!(result.as_deref(), Some("41 00 \r\r>"));
    }

    #[test]
    fn test_pos_answer_11bit() {
        let mut counters = Counters::new();
        counters.set(keys::USE_HEADER, true);
        let (result, _) = render(&mut counters, "<pos_answer>57</pos_answer>", Some("7E0"), Some("22F190"));
        assert_eq!(result.as_deref(), Some("7E8 03 62 F1 57 \r\r>"));
    }

    #[test]
    fn test_pos_answer_missing_request() {
        let mut counters = Counters::new();
        let (result, _) = render(&mut counters, "<pos_answer>57</pos_answer>", Some("7E0"), None);
        assert_eq!(result, None);
        let (result, _) = render(&mut counters, "<neg_answer>31</neg_answer>", Some("7E0"), Some("ZZ"));
        assert_eq!(result, None);
    }

    #[test]
    fn test_neg_answer_uses_set_header() {
        let mut counters = Counters::new();
        counters.set(keys::SET_HEADER, "7E0");
        let (result, _) = render(&mut counters, "<neg_answer>31</neg_answer>", None, Some("22F190"));
        assert_eq!(result.as_deref(), Some("7F 22 31 \r\r>"));
    }

    #[test]
    fn test_exec_flushes_and_eval_appends() {
        let mut counters = Counters::new();
        counters.set("n", 1i64);
        let (result, chunks) = render(
            &mut counters,
            "<string>A</string><exec>n = n + 1</exec><eval>n</eval>",
            None,
            None,
        );
        assert_eq!(result.as_deref(), Some("2\r>"));
        assert_eq!(chunks, vec!["A".to_string(), "2\r>".to_string()]);
        assert_eq!(counters.int("n"), Some(2));
    }

    #[test]
    fn test_rh_override() {
        let mut counters = Counters::new();
        counters.set(keys::USE_HEADER, true);
        let (result, _) = render(&mut counters, "<rh>7E1</rh><answer>4100</answer>", Some("7E0"), None);
        assert_eq!(result.as_deref(), Some("7E9 02 41 00 \r\r>"));
    }
}
