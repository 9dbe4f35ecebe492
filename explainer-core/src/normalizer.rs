use crate::model::ChatRequest;
use unicode_normalization::UnicodeNormalization;

/// Unicode NFC normalization + BOM strip + CRLF -> LF + trim.
pub fn clean_text(s: &str) -> String {
    let mut t = s.nfc().collect::<String>();
    if t.starts_with('\u{FEFF}') {
        t.remove(0);
    }
    if t.contains("\r\n") {
        t = t.replace("\r\n", "\n");
    }
    t.trim().to_string()
}

/// Collapse runs of blank lines left behind by scraped markup.
pub fn squeeze_blank_lines(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut blank_run = 0usize;
    for line in s.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(line);
        out.push('\n');
    }
    out.trim_end().to_string()
}

fn clamp_round_f32(x: f32, lo: f32, hi: f32, dp: u32) -> f32 {
    let clamped = x.clamp(lo, hi);
    let p = 10f32.powi(dp as i32);
    (clamped * p).round() / p
}

pub fn normalize_chat(mut req: ChatRequest) -> ChatRequest {
    req.temperature = req.temperature.map(|t| clamp_round_f32(t, 0.0, 2.0, 3));
    if let Some(max) = req.max_output_tokens {
        if max == 0 {
            req.max_output_tokens = None;
        } else if max > 100_000 {
            req.max_output_tokens = Some(100_000);
        }
    }
    req
}
