//! Content extraction and cleaning.
//!
//! Everything in this module is synchronous and deterministic: cleaning
//! the same raw input twice yields byte-identical results. Network work
//! happens upstream in the fetcher; this module only transforms.
//!
//! Extraction prefers readability's main-content detection, then
//! semantic containers, then full-body text with boilerplate regions
//! stripped by a data-driven rule set.

use std::collections::{HashMap, HashSet};
use std::io::Cursor;

use chrono::{DateTime, NaiveDate, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

/// Cleaned article content and derived metadata. Per-request: discarded
/// after the pipeline invocation returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedContent {
    pub title: String,
    pub raw_text: String,
    pub cleaned_text: String,
    pub language: String,
    pub word_count: usize,
    pub reading_time_minutes: u32,
    pub keywords: Vec<String>,
    pub detected_publish_date: Option<DateTime<Utc>>,
}

/// Classification tag for a boilerplate rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleTag {
    Navigation,
    Advertisement,
    SocialShare,
    Newsletter,
    CookieNotice,
    Legal,
}

/// A boilerplate detection rule: a regex pattern plus what it flags.
/// The set is data-driven so deployments can extend it without code
/// changes.
pub struct BoilerplateRule {
    pub pattern: &'static str,
    pub tag: RuleTag,
}

/// Line-level boilerplate patterns, applied to extracted paragraphs.
pub const BOILERPLATE_LINE_RULES: &[BoilerplateRule] = &[
    BoilerplateRule {
        pattern: r"(?i)\b(subscribe|sign up)\b.*\b(newsletter|updates|inbox)\b",
        tag: RuleTag::Newsletter,
    },
    BoilerplateRule {
        pattern: r"(?i)\bshare (this|on)\b|\bfollow us\b",
        tag: RuleTag::SocialShare,
    },
    BoilerplateRule {
        pattern: r"(?i)\badvertisement\b|\bsponsored content\b|\bpromoted\b",
        tag: RuleTag::Advertisement,
    },
    BoilerplateRule {
        pattern: r"(?i)\bcookies?\b.*\b(policy|consent|settings|accept)\b",
        tag: RuleTag::CookieNotice,
    },
    BoilerplateRule {
        pattern: r"(?i)\ball rights reserved\b|\bterms of (use|service)\b|\bprivacy policy\b",
        tag: RuleTag::Legal,
    },
    BoilerplateRule {
        pattern: r"(?i)^\s*(home|menu|search|log ?in|sign in|read more|skip to content)\s*$",
        tag: RuleTag::Navigation,
    },
];

static COMPILED_LINE_RULES: Lazy<Vec<(Regex, RuleTag)>> = Lazy::new(|| {
    BOILERPLATE_LINE_RULES
        .iter()
        .filter_map(|rule| Regex::new(rule.pattern).ok().map(|re| (re, rule.tag)))
        .collect()
});

/// Container class/id fragments that mark boilerplate regions.
static BOILERPLATE_ATTR_RE: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(nav|menu|sidebar|footer|header|share|social|newsletter|subscribe|promo|advert|banner|cookie|comment|related|breadcrumb)",
    )
    .ok()
});

/// Tags whose subtrees never contribute article text.
const BOILERPLATE_TAGS: &[&str] = &[
    "nav", "header", "footer", "aside", "form", "script", "style", "noscript", "iframe", "button",
    "figure",
];

/// Semantic content containers, in priority order.
const CONTENT_SELECTORS: &[&str] = &[
    "article",
    "main",
    "[role='main']",
    ".post-content",
    ".article-content",
    ".entry-content",
    ".story-body",
    ".article__body",
    ".content-body",
    "#article-body",
    "#content",
];

const MIN_PARAGRAPH_CHARS: usize = 30;
const SUBSTANTIAL_CONTENT_CHARS: usize = 200;

/// Clean raw HTML or plain text into structured article content.
pub fn clean(raw: &str) -> ExtractedContent {
    clean_with_url(raw, None)
}

/// Clean with a base URL so readability can resolve relative links.
pub fn clean_with_url(raw: &str, base_url: Option<&Url>) -> ExtractedContent {
    let trimmed = raw.trim();

    let (title, raw_text, detected_publish_date) = if looks_like_html(trimmed) {
        let doc = Html::parse_document(trimmed);
        let title = extract_title(&doc);
        let date = extract_publish_date(&doc);
        let text = extract_article_text(trimmed, &doc, base_url);
        (title, text, date)
    } else {
        (first_line_title(trimmed), trimmed.to_string(), None)
    };

    let cleaned_text = clean_text(&raw_text);
    let language = detect_language(&cleaned_text);
    let (word_count, reading_time_minutes) = count_and_reading_time(&cleaned_text, language);
    let keywords = extract_keywords(&cleaned_text);

    ExtractedContent {
        title,
        raw_text,
        cleaned_text,
        language: language.to_string(),
        word_count,
        reading_time_minutes,
        keywords,
        detected_publish_date,
    }
}

fn looks_like_html(text: &str) -> bool {
    text.starts_with('<')
        || text.contains("<html")
        || text.contains("<body")
        || text.contains("<div")
        || text.contains("<p>")
        || text.contains("</")
}

/// Pull article text out of HTML, trying strategies in order:
/// readability, semantic containers, body fallback.
fn extract_article_text(raw: &str, doc: &Html, base_url: Option<&Url>) -> String {
    // readability needs a concrete URL to resolve relative links
    let url = base_url
        .cloned()
        .unwrap_or_else(|| Url::parse("http://localhost/").expect("static URL parses"));

    let mut reader = Cursor::new(raw.as_bytes());
    match readability::extractor::extract(&mut reader, &url) {
        Ok(product) if product.text.trim().chars().count() >= SUBSTANTIAL_CONTENT_CHARS => {
            // Convert the extracted HTML for cleaner downstream input;
            // readability's plain text loses paragraph structure.
            match html2text::from_read(product.content.as_bytes(), 80) {
                Ok(text) => {
                    debug!(chars = text.len(), "readability extracted main content");
                    return text;
                }
                Err(e) => {
                    warn!("failed to convert extracted HTML to text: {}", e);
                    return product.text;
                }
            }
        }
        Ok(_) => debug!("readability result too thin, trying semantic containers"),
        Err(e) => debug!("readability failed: {}", e),
    }

    for selector_str in CONTENT_SELECTORS {
        if let Ok(selector) = Selector::parse(selector_str) {
            if let Some(element) = doc.select(&selector).next() {
                let text = paragraphs_under(element);
                if text.chars().count() >= SUBSTANTIAL_CONTENT_CHARS {
                    return text;
                }
            }
        }
    }

    body_fallback_text(doc)
}

/// Collect paragraph-level text beneath an element, skipping
/// boilerplate subtrees.
fn paragraphs_under(root: ElementRef) -> String {
    let mut paragraphs = Vec::new();
    if let Ok(selector) = Selector::parse("p, h1, h2, h3, li, blockquote") {
        for el in root.select(&selector) {
            if in_boilerplate_region(el) {
                continue;
            }
            let text = collapse_whitespace(&element_text(el));
            if !text.is_empty() {
                paragraphs.push(text);
            }
        }
    }
    if paragraphs.is_empty() {
        collapse_whitespace(&element_text(root))
    } else {
        paragraphs.join("\n\n")
    }
}

/// Full-body fallback: paragraph elements anywhere outside boilerplate
/// regions.
fn body_fallback_text(doc: &Html) -> String {
    if let Ok(body_selector) = Selector::parse("body") {
        if let Some(body) = doc.select(&body_selector).next() {
            return paragraphs_under(body);
        }
    }
    String::new()
}

/// Whether an element sits inside a region classified as boilerplate,
/// by tag name or by class/id pattern.
fn in_boilerplate_region(el: ElementRef) -> bool {
    for ancestor in el.ancestors() {
        let Some(element) = ancestor.value().as_element() else {
            continue;
        };
        if BOILERPLATE_TAGS.contains(&element.name()) {
            return true;
        }
        if let Some(re) = BOILERPLATE_ATTR_RE.as_ref() {
            let class_attr = element.attr("class").unwrap_or("");
            let id_attr = element.attr("id").unwrap_or("");
            if (!class_attr.is_empty() && re.is_match(class_attr))
                || (!id_attr.is_empty() && re.is_match(id_attr))
            {
                return true;
            }
        }
    }
    false
}

fn element_text(el: ElementRef) -> String {
    el.text().collect::<Vec<_>>().join(" ")
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Clean extracted text: strip boilerplate lines, drop noise
/// paragraphs, and remove near-duplicate sentences.
fn clean_text(text: &str) -> String {
    let mut seen_sentences: HashSet<String> = HashSet::new();
    let mut kept_paragraphs = Vec::new();

    for paragraph in split_paragraphs(text) {
        if paragraph.chars().count() < MIN_PARAGRAPH_CHARS {
            continue;
        }
        if boilerplate_tag_for(&paragraph).is_some() {
            continue;
        }

        let mut kept_sentences = Vec::new();
        for sentence in split_sentences(&paragraph) {
            let key = normalize_sentence(&sentence);
            if key.is_empty() || !seen_sentences.insert(key) {
                continue;
            }
            kept_sentences.push(sentence);
        }

        if !kept_sentences.is_empty() {
            kept_paragraphs.push(kept_sentences.join(" "));
        }
    }

    kept_paragraphs.join("\n\n")
}

/// Which boilerplate rule (if any) a paragraph matches.
pub fn boilerplate_tag_for(paragraph: &str) -> Option<RuleTag> {
    COMPILED_LINE_RULES
        .iter()
        .find(|(re, _)| re.is_match(paragraph))
        .map(|(_, tag)| *tag)
}

/// Group lines into paragraphs at blank-line boundaries, collapsing
/// internal whitespace.
fn split_paragraphs(text: &str) -> Vec<String> {
    let mut paragraphs = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                paragraphs.push(collapse_whitespace(&current.join(" ")));
                current.clear();
            }
        } else {
            current.push(line);
        }
    }
    if !current.is_empty() {
        paragraphs.push(collapse_whitespace(&current.join(" ")));
    }
    paragraphs
}

/// Split text into sentences, keeping terminal punctuation.
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        current.push(ch);
        if matches!(ch, '.' | '!' | '?' | '。' | '！' | '？') {
            let s = current.trim();
            if !s.is_empty() {
                sentences.push(s.to_string());
            }
            current.clear();
        }
    }
    let tail = current.trim();
    if !tail.is_empty() {
        sentences.push(tail.to_string());
    }
    sentences
}

fn normalize_sentence(sentence: &str) -> String {
    sentence
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

// --- language detection -------------------------------------------------

fn is_han(c: char) -> bool {
    matches!(c, '\u{4E00}'..='\u{9FFF}' | '\u{3400}'..='\u{4DBF}')
}

fn is_kana(c: char) -> bool {
    matches!(c, '\u{3040}'..='\u{30FF}')
}

fn is_hangul(c: char) -> bool {
    matches!(c, '\u{AC00}'..='\u{D7AF}' | '\u{1100}'..='\u{11FF}')
}

fn is_arabic(c: char) -> bool {
    matches!(c, '\u{0600}'..='\u{06FF}' | '\u{0750}'..='\u{077F}')
}

fn is_cyrillic(c: char) -> bool {
    matches!(c, '\u{0400}'..='\u{04FF}')
}

fn is_cjk(c: char) -> bool {
    is_han(c) || is_kana(c) || is_hangul(c)
}

/// Detect the dominant language by script code-point ratios.
/// Deterministic: ties and unknown scripts fall back to "en".
pub fn detect_language(text: &str) -> &'static str {
    let mut total = 0usize;
    let (mut han, mut kana, mut hangul, mut arabic, mut cyrillic) = (0, 0, 0, 0, 0);

    for c in text.chars().filter(|c| c.is_alphabetic()) {
        total += 1;
        if is_han(c) {
            han += 1;
        } else if is_kana(c) {
            kana += 1;
        } else if is_hangul(c) {
            hangul += 1;
        } else if is_arabic(c) {
            arabic += 1;
        } else if is_cyrillic(c) {
            cyrillic += 1;
        }
    }

    if total == 0 {
        return "en";
    }
    let ratio = |count: usize| count as f64 / total as f64;

    // Kana is exclusive to Japanese, so even a modest share decides it.
    if ratio(kana) > 0.05 {
        "ja"
    } else if ratio(hangul) > 0.3 {
        "ko"
    } else if ratio(han) > 0.3 {
        "zh"
    } else if ratio(arabic) > 0.3 {
        "ar"
    } else if ratio(cyrillic) > 0.3 {
        "ru"
    } else {
        "en"
    }
}

/// Word count and reading time, differing by language family:
/// logographic scripts are counted per character at 300/min, Arabic
/// per token at 180/min, everything else per token at 200/min.
fn count_and_reading_time(text: &str, language: &str) -> (usize, u32) {
    let (count, per_minute) = match language {
        "zh" | "ja" | "ko" => {
            let cjk_chars = text.chars().filter(|c| is_cjk(*c)).count();
            let latin_tokens = text
                .split_whitespace()
                .filter(|t| t.chars().any(|c| c.is_ascii_alphanumeric()))
                .count();
            (cjk_chars + latin_tokens, 300)
        }
        "ar" => (text.split_whitespace().count(), 180),
        _ => (text.split_whitespace().count(), 200),
    };

    if count == 0 {
        return (0, 0);
    }
    let minutes = ((count as f64) / (per_minute as f64)).ceil() as u32;
    (count, minutes.max(1))
}

// --- keywords -----------------------------------------------------------

const STOP_WORDS: &[&str] = &[
    "a", "about", "after", "all", "also", "an", "and", "any", "are", "as", "at", "be", "because",
    "been", "but", "by", "can", "could", "did", "do", "does", "for", "from", "had", "has", "have",
    "he", "her", "his", "how", "i", "if", "in", "into", "is", "it", "its", "just", "like", "may",
    "more", "most", "new", "no", "not", "now", "of", "on", "one", "only", "or", "other", "our",
    "out", "over", "said", "she", "so", "some", "such", "than", "that", "the", "their", "them",
    "then", "there", "these", "they", "this", "those", "to", "two", "up", "was", "we", "were",
    "what", "when", "which", "who", "will", "with", "would", "you", "your",
];

/// Tokenize into lowercase alphanumeric runs and CJK runs.
fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut latin = String::new();
    let mut cjk = String::new();

    let mut flush_latin = |buf: &mut String, out: &mut Vec<String>| {
        if !buf.is_empty() {
            out.push(buf.to_lowercase());
            buf.clear();
        }
    };

    for c in text.chars() {
        if is_cjk(c) {
            flush_latin(&mut latin, &mut tokens);
            cjk.push(c);
        } else if c.is_alphanumeric() {
            if !cjk.is_empty() {
                tokens.push(cjk.clone());
                cjk.clear();
            }
            latin.push(c);
        } else {
            flush_latin(&mut latin, &mut tokens);
            if !cjk.is_empty() {
                tokens.push(cjk.clone());
                cjk.clear();
            }
        }
    }
    flush_latin(&mut latin, &mut tokens);
    if !cjk.is_empty() {
        tokens.push(cjk);
    }
    tokens
}

fn is_keyword_candidate(token: &str) -> bool {
    let chars = token.chars().count();
    if token.chars().all(|c| c.is_ascii_digit()) {
        return false;
    }
    if token.chars().any(is_cjk) {
        chars >= 2
    } else {
        chars >= 3
    }
}

/// Frequency-based keywords: stop words removed, minimum length and
/// alphanumeric-or-CJK filter, at least two occurrences. Output is
/// sorted by frequency then alphabetically, so it is deterministic.
pub fn extract_keywords(text: &str) -> Vec<String> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for token in tokenize(text) {
        if !is_keyword_candidate(&token) || STOP_WORDS.contains(&token.as_str()) {
            continue;
        }
        *counts.entry(token).or_insert(0) += 1;
    }

    let mut pairs: Vec<(String, usize)> =
        counts.into_iter().filter(|(_, count)| *count >= 2).collect();
    pairs.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    pairs.into_iter().take(10).map(|(token, _)| token).collect()
}

// --- extractive summary -------------------------------------------------

/// Token-overlap similarity between two sentences, in [0, 1].
pub fn token_overlap(a: &str, b: &str) -> f64 {
    let set_a: HashSet<String> = tokenize(a).into_iter().collect();
    let set_b: HashSet<String> = tokenize(b).into_iter().collect();
    if set_a.is_empty() && set_b.is_empty() {
        return 1.0;
    }
    if set_a.is_empty() || set_b.is_empty() {
        return 0.0;
    }
    let intersection = set_a.intersection(&set_b).count();
    intersection as f64 / set_a.len().max(set_b.len()) as f64
}

const DUPLICATE_SIMILARITY: f64 = 0.8;

/// Extractive fallback summary: sentences scored by position, length
/// band, and keyword density; near-identical sentences dropped; winners
/// emitted in document order.
pub fn extractive_summary(text: &str, keywords: &[String], max_sentences: usize) -> Vec<String> {
    let sentences = split_sentences(text);
    if sentences.is_empty() || max_sentences == 0 {
        return Vec::new();
    }

    let mut scored: Vec<(usize, f64)> = sentences
        .iter()
        .enumerate()
        .map(|(i, s)| (i, score_sentence(i, s, keywords)))
        .collect();
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let mut selected: Vec<usize> = Vec::new();
    for (i, _) in scored {
        let candidate = &sentences[i];
        let duplicate = selected
            .iter()
            .any(|&j| token_overlap(candidate, &sentences[j]) >= DUPLICATE_SIMILARITY);
        if duplicate {
            continue;
        }
        selected.push(i);
        if selected.len() >= max_sentences {
            break;
        }
    }

    selected.sort_unstable();
    selected.into_iter().map(|i| sentences[i].clone()).collect()
}

fn score_sentence(index: usize, sentence: &str, keywords: &[String]) -> f64 {
    let position = if index == 0 {
        3.0
    } else if index < 3 {
        2.0
    } else {
        1.0 / (1.0 + index as f64 * 0.05)
    };

    let chars = sentence.chars().count();
    let length = if (40..=220).contains(&chars) {
        1.0
    } else if (20..40).contains(&chars) || (221..=320).contains(&chars) {
        0.3
    } else {
        0.0
    };

    let tokens = tokenize(sentence);
    let density = if tokens.is_empty() {
        0.0
    } else {
        let hits = tokens.iter().filter(|t| keywords.contains(t)).count();
        (hits as f64 / tokens.len() as f64 * 5.0).min(2.0)
    };

    position + length + density
}

// --- title & publish date -----------------------------------------------

fn extract_title(doc: &Html) -> String {
    if let Ok(selector) = Selector::parse("meta[property='og:title']") {
        if let Some(meta) = doc.select(&selector).next() {
            if let Some(content) = meta.value().attr("content") {
                let title = collapse_whitespace(content);
                if !title.is_empty() {
                    return title;
                }
            }
        }
    }
    if let Ok(selector) = Selector::parse("title") {
        if let Some(el) = doc.select(&selector).next() {
            let title = collapse_whitespace(&element_text(el));
            if !title.is_empty() {
                return title;
            }
        }
    }
    if let Ok(selector) = Selector::parse("h1") {
        if let Some(el) = doc.select(&selector).next() {
            return collapse_whitespace(&element_text(el));
        }
    }
    String::new()
}

fn first_line_title(text: &str) -> String {
    let line = text.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
    line.trim().chars().take(120).collect()
}

fn extract_publish_date(doc: &Html) -> Option<DateTime<Utc>> {
    if let Ok(selector) = Selector::parse("meta[property='article:published_time']") {
        if let Some(meta) = doc.select(&selector).next() {
            if let Some(value) = meta.value().attr("content") {
                if let Some(date) = parse_date(value) {
                    return Some(date);
                }
            }
        }
    }
    if let Ok(selector) = Selector::parse("time[datetime]") {
        if let Some(el) = doc.select(&selector).next() {
            if let Some(value) = el.value().attr("datetime") {
                return parse_date(value);
            }
        }
    }
    None
}

fn parse_date(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(date) = DateTime::parse_from_rfc3339(value.trim()) {
        return Some(date.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| DateTime::from_naive_utc_and_offset(dt, Utc))
}
