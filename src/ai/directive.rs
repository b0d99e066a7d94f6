//! モデル応答パーサー
//!
//! モデルの出力は単一の XML 文書ではなく、`<thinking>`・`<satellite>`・`<answer>` などの
//! タグが並んだテキスト断片である。これを合成ルート要素で包んだものとして読み、
//! [`ParsedDirective`] に変換する。
//!
//! - `<answer>` があれば、それが常に優先される（`FinalAnswer`）
//! - `<answer>` がなく `<satellite>` があれば `RequestSatellite`
//! - どちらもない、または構造が壊れている場合は `Incomplete`
//!
//! 特定のマークアップライブラリには依存せず、必要最小限のタグ木リーダーを内蔵する。

use tracing::{debug, warn};

use super::types::{Location, ParsedDirective};

/// 地名フィールドの既定値
pub const UNKNOWN_PLACE: &str = "Unknown";
/// 数値フィールドの既定値
pub const UNKNOWN_NUMBER: &str = "0";

/// モデル応答テキストを解釈する。失敗はせず、読めない応答は `Incomplete` になる。
pub fn parse(text: &str) -> ParsedDirective {
    let root = match parse_fragment(text) {
        Ok(root) => root,
        Err(e) => {
            debug!(error = %e, reply_length = text.len(), "Reply is not well-formed, treating as incomplete");
            return ParsedDirective::Incomplete;
        }
    };

    if let Some(answer) = root.find("answer") {
        let location = Location {
            city: place_field(&root, answer, "city"),
            country: place_field(&root, answer, "country"),
            latitude: number_field(&root, answer, "latitude"),
            longitude: number_field(&root, answer, "longitude"),
            confidence: number_field(&root, answer, "confidence"),
        };
        debug!(city = %location.city, country = %location.country, "Parsed final answer");
        return ParsedDirective::FinalAnswer(location);
    }

    if let Some(satellite) = root.find("satellite") {
        let latitude = coordinate(satellite, "latitude", 90.0);
        let longitude = coordinate(satellite, "longitude", 180.0);
        return match (latitude, longitude) {
            (Some(latitude), Some(longitude)) => {
                debug!(latitude, longitude, "Parsed satellite request");
                ParsedDirective::RequestSatellite {
                    latitude,
                    longitude,
                }
            }
            _ => {
                warn!(
                    satellite = %satellite.text_content(),
                    "Satellite request without usable coordinates, treating as incomplete"
                );
                ParsedDirective::Incomplete
            }
        };
    }

    ParsedDirective::Incomplete
}

/// `<answer>` 内 → 応答全体の順にフィールドを探し、テキストをそのまま返す。
/// 空白だけのテキストは欠落とみなす。
fn lookup(root: &Element, answer: &Element, name: &str) -> Option<String> {
    answer
        .find(name)
        .or_else(|| root.find(name))
        .map(|e| e.text_content())
        .filter(|s| !s.trim().is_empty())
}

fn place_field(root: &Element, answer: &Element, name: &str) -> String {
    lookup(root, answer, name).unwrap_or_else(|| UNKNOWN_PLACE.to_string())
}

/// 数値として読めない値（`85%` なども含む）は既定値に置き換える。
fn number_field(root: &Element, answer: &Element, name: &str) -> String {
    lookup(root, answer, name)
        .filter(|s| s.trim().parse::<f64>().map(f64::is_finite).unwrap_or(false))
        .unwrap_or_else(|| UNKNOWN_NUMBER.to_string())
}

fn coordinate(satellite: &Element, name: &str, limit: f64) -> Option<f64> {
    let value = satellite
        .find(name)?
        .text_content()
        .trim()
        .parse::<f64>()
        .ok()?;
    (value.is_finite() && value.abs() <= limit).then_some(value)
}

// ---------------------------------------------------------------------------
// タグ木リーダー
// ---------------------------------------------------------------------------

/// タグ木のノード
#[derive(Debug, Clone, PartialEq)]
enum Node {
    Element(Element),
    Text(String),
}

/// 要素。属性は保持しない。
#[derive(Debug, Clone, PartialEq)]
struct Element {
    name: String,
    children: Vec<Node>,
}

impl Element {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            children: Vec::new(),
        }
    }

    /// 子孫要素を文書順（深さ優先・行きがけ順）に探し、最初に一致したものを返す。
    fn find(&self, name: &str) -> Option<&Element> {
        for child in &self.children {
            if let Node::Element(e) = child {
                if e.name == name {
                    return Some(e);
                }
                if let Some(found) = e.find(name) {
                    return Some(found);
                }
            }
        }
        None
    }

    /// 子孫テキストをすべて連結したもの
    fn text_content(&self) -> String {
        let mut out = String::new();
        self.collect_text(&mut out);
        out
    }

    fn collect_text(&self, out: &mut String) {
        for child in &self.children {
            match child {
                Node::Text(t) => out.push_str(t),
                Node::Element(e) => e.collect_text(out),
            }
        }
    }
}

/// 構造エラー
#[derive(Debug, Clone, PartialEq)]
struct ParseError(String);

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// テキスト断片を合成ルート要素の子として読み込む。
fn parse_fragment(input: &str) -> Result<Element, ParseError> {
    let mut stack: Vec<Element> = vec![Element::new("root")];
    let mut pos = 0;

    while pos < input.len() {
        let rest = &input[pos..];
        let Some(lt) = rest.find('<') else {
            push_text(&mut stack, rest);
            break;
        };
        if lt > 0 {
            push_text(&mut stack, &rest[..lt]);
        }
        let markup = &rest[lt..];

        if let Some(body) = markup.strip_prefix("<!--") {
            let end = body
                .find("-->")
                .ok_or_else(|| ParseError("unterminated comment".to_string()))?;
            pos += lt + 4 + end + 3;
        } else if let Some(body) = markup.strip_prefix("<![CDATA[") {
            let end = body
                .find("]]>")
                .ok_or_else(|| ParseError("unterminated CDATA section".to_string()))?;
            top(&mut stack).children.push(Node::Text(body[..end].to_string()));
            pos += lt + 9 + end + 3;
        } else if let Some(body) = markup.strip_prefix("<?") {
            let end = body
                .find("?>")
                .ok_or_else(|| ParseError("unterminated processing instruction".to_string()))?;
            pos += lt + 2 + end + 2;
        } else if markup.starts_with("<!") {
            let end = markup
                .find('>')
                .ok_or_else(|| ParseError("unterminated declaration".to_string()))?;
            pos += lt + end + 1;
        } else if let Some(body) = markup.strip_prefix("</") {
            let end = body
                .find('>')
                .ok_or_else(|| ParseError("unterminated closing tag".to_string()))?;
            let name = body[..end].trim();
            close_element(&mut stack, name)?;
            pos += lt + 2 + end + 1;
        } else {
            let end = find_tag_end(markup)
                .ok_or_else(|| ParseError("unterminated opening tag".to_string()))?;
            let inner = &markup[1..end];
            let (inner, self_closing) = match inner.strip_suffix('/') {
                Some(stripped) => (stripped, true),
                None => (inner, false),
            };
            let name = tag_name(inner)?;
            if self_closing {
                top(&mut stack).children.push(Node::Element(Element::new(name)));
            } else {
                stack.push(Element::new(name));
            }
            pos += lt + end + 1;
        }
    }

    if stack.len() > 1 {
        let unclosed: Vec<&str> = stack[1..].iter().map(|e| e.name.as_str()).collect();
        return Err(ParseError(format!("unclosed tags: {}", unclosed.join(", "))));
    }
    stack
        .pop()
        .ok_or_else(|| ParseError("empty element stack".to_string()))
}

fn top(stack: &mut [Element]) -> &mut Element {
    // ルート要素は最後まで取り除かれない
    let last = stack.len() - 1;
    &mut stack[last]
}

fn push_text(stack: &mut [Element], raw: &str) {
    top(stack).children.push(Node::Text(decode_entities(raw)));
}

fn close_element(stack: &mut Vec<Element>, name: &str) -> Result<(), ParseError> {
    if stack.len() < 2 {
        return Err(ParseError(format!("unexpected closing tag </{name}>")));
    }
    let current = &stack[stack.len() - 1].name;
    if current != name {
        return Err(ParseError(format!(
            "mismatched closing tag </{name}>, expected </{current}>"
        )));
    }
    if let Some(done) = stack.pop() {
        top(stack).children.push(Node::Element(done));
    }
    Ok(())
}

/// 属性値のクォートを考慮して、開始タグを閉じる `>` の位置を返す。
fn find_tag_end(markup: &str) -> Option<usize> {
    let mut quote: Option<char> = None;
    for (i, c) in markup.char_indices().skip(1) {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') => quote = Some(c),
            (None, '>') => return Some(i),
            (None, '<') => return None,
            _ => {}
        }
    }
    None
}

fn tag_name(inner: &str) -> Result<&str, ParseError> {
    let name = inner
        .split(|c: char| c.is_whitespace())
        .next()
        .unwrap_or_default();
    let mut chars = name.chars();
    let valid_start = matches!(chars.next(), Some(c) if c.is_alphabetic() || c == '_' || c == ':');
    let valid_rest = chars.all(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'));
    if valid_start && valid_rest {
        Ok(name)
    } else {
        Err(ParseError(format!("invalid tag name in <{inner}>")))
    }
}

/// 定義済み実体と文字参照を展開する。未知の実体や裸の `&` はそのまま残す。
fn decode_entities(raw: &str) -> String {
    if !raw.contains('&') {
        return raw.to_string();
    }

    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let candidate = &rest[amp..];
        match candidate.find(';').and_then(|semi| {
            decode_entity(&candidate[1..semi]).map(|decoded| (decoded, semi))
        }) {
            Some((decoded, semi)) => {
                out.push(decoded);
                rest = &candidate[semi + 1..];
            }
            None => {
                out.push('&');
                rest = &candidate[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn decode_entity(entity: &str) -> Option<char> {
    match entity {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        _ => {
            let code = if let Some(hex) = entity
                .strip_prefix("#x")
                .or_else(|| entity.strip_prefix("#X"))
            {
                u32::from_str_radix(hex, 16).ok()?
            } else {
                entity.strip_prefix('#')?.parse::<u32>().ok()?
            };
            char::from_u32(code)
        }
    }
}
