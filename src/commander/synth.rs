//! Worker synthesis from unmatched task text.

use std::collections::HashMap;

use serde_json::json;
use sha2::{Digest, Sha256};

use crate::store::WorkerDefinition;

/// Function words ignored when extracting keywords (English and Turkish).
const STOP_WORDS: &[&str] = &[
    // English
    "the", "and", "for", "with", "that", "this", "from", "into", "onto", "about", "over",
    "under", "are", "was", "were", "been", "being", "have", "has", "had", "will", "would",
    "should", "could", "can", "may", "might", "must", "shall", "not", "but", "all", "any",
    "our", "your", "their", "its", "his", "her", "they", "them", "you", "who", "what",
    "which", "when", "where", "how", "why", "then", "than", "there", "here", "also",
    "just", "some", "such", "each", "every", "more", "most", "very", "please", "make",
    "need", "needs", "new", "use", "using", "via", "per", "out", "off", "too", "let",
    // Turkish
    "bir", "bu", "şu", "ve", "ile", "için", "gibi", "daha", "çok", "olan", "olarak",
    "ama", "fakat", "veya", "ya", "da", "de", "mi", "mı", "mu", "mü", "ne", "nasıl",
    "neden", "kadar", "sonra", "önce", "her", "hem", "ise", "yeni", "lütfen", "yap",
    "yapın", "yapmak", "bunu", "şunu", "tüm", "bütün", "diye", "göre",
];

const COLORS: &[&str] = &[
    "#f97316", "#84cc16", "#14b8a6", "#06b6d4", "#8b5cf6", "#d946ef", "#f43f5e", "#eab308",
    "#22c55e", "#3b82f6",
];

const ICONS: &[&str] = &["🧭", "🧪", "📦", "🧩", "🔭", "🗂", "⚙", "📡", "🧮", "🪄"];

/// Content words of `text`, ranked by frequency then first occurrence.
pub fn keywords(text: &str, count: usize) -> Vec<String> {
    let lower = text.to_lowercase();
    let mut seen: HashMap<&str, (usize, usize)> = HashMap::new();

    let tokens = lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= 3)
        .filter(|t| !t.chars().all(|c| c.is_numeric()))
        .filter(|t| !STOP_WORDS.contains(t));

    for (position, token) in tokens.enumerate() {
        seen.entry(token).or_insert((0, position)).0 += 1;
    }

    let mut ranked: Vec<(&str, usize, usize)> =
        seen.into_iter().map(|(t, (n, first))| (t, n, first)).collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));
    ranked
        .into_iter()
        .take(count)
        .map(|(t, _, _)| t.to_string())
        .collect()
}

/// First id of `base`, `base-2`, `base-3`, … for which `taken` is false.
pub fn unique_id(base: &str, taken: impl Fn(&str) -> bool) -> String {
    if !taken(base) {
        return base.to_string();
    }
    (2..)
        .map(|n| format!("{base}-{n}"))
        .find(|id| !taken(id))
        .unwrap_or_else(|| base.to_string())
}

/// Icon and color derived from the worker id. Equal ids give equal cosmetics.
pub fn cosmetics(id: &str) -> (&'static str, &'static str) {
    let digest = Sha256::digest(id.as_bytes());
    let icon = ICONS[digest[0] as usize % ICONS.len()];
    let color = COLORS[digest[1] as usize % COLORS.len()];
    (icon, color)
}

/// Short hex fingerprint of the id, stored with the worker.
fn fingerprint(id: &str) -> String {
    hex::encode(&Sha256::digest(id.as_bytes())[..4])
}

fn title_case(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Build a worker definition for `text`, or `None` if it has no content words.
pub fn synthesize(
    text: &str,
    keyword_count: usize,
    taken: impl Fn(&str) -> bool,
) -> Option<WorkerDefinition> {
    let words = keywords(text, keyword_count.max(1));
    if words.is_empty() {
        return None;
    }

    let id = unique_id(&words.join("-"), taken);
    let name = words
        .iter()
        .map(|w| title_case(w))
        .collect::<Vec<_>>()
        .join(" ");
    let (icon, color) = cosmetics(&id);
    let seed: String = text.trim().chars().take(500).collect();

    let template = format!(
        "You are {{name}}, a specialist created for work like this request:\n\n\"{seed}\"\n\n\
         Focus on {}. Keep notes of your progress in output/ and explain what you did.",
        words.join(", ")
    );

    let mut worker = WorkerDefinition::new(&id, name)
        .with_cosmetics(icon, color)
        .with_description(format!("Created for: {}", seed.chars().take(120).collect::<String>()))
        .with_triggers(words)
        .with_instructions(template);
    worker.metadata.insert("synthesized".to_string(), json!(true));
    worker.metadata.insert("seed_text".to_string(), json!(seed));
    worker
        .metadata
        .insert("fingerprint".to_string(), json!(fingerprint(&id)));
    Some(worker)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keywords_rank_by_frequency_then_position() {
        let words = keywords("SEO audit for the shop: audit the shop SEO and 2024 backlinks", 3);
        assert_eq!(words, vec!["seo", "audit", "shop"]);
    }

    #[test]
    fn test_keywords_skip_stop_words_numbers_and_short_tokens() {
        assert!(keywords("the and for 123 4567 ab", 3).is_empty());
        assert_eq!(keywords("bir yeni müşteri anketi hazırla", 2), vec!["müşteri", "anketi"]);
    }

    #[test]
    fn test_unique_id_suffixes() {
        let taken = ["seo-audit", "seo-audit-2"];
        assert_eq!(unique_id("seo-audit", |id| taken.contains(&id)), "seo-audit-3");
        assert_eq!(unique_id("fresh", |id| taken.contains(&id)), "fresh");
    }

    #[test]
    fn test_cosmetics_are_deterministic() {
        assert_eq!(cosmetics("seo-audit"), cosmetics("seo-audit"));
        let (_, color) = cosmetics("anything");
        assert!(color.starts_with('#'));
    }

    #[test]
    fn test_synthesize_worker() {
        let worker = synthesize("Translate the menu into Japanese, menu first", 3, |_| false).unwrap();
        assert_eq!(worker.id, "menu-translate-japanese");
        assert_eq!(worker.name, "Menu Translate Japanese");
        assert_eq!(worker.triggers, vec!["menu", "translate", "japanese"]);
        assert!(!worker.protected);
        assert_eq!(worker.metadata["synthesized"], true);
        assert!(worker.instruction_template.contains("Translate the menu"));
        assert_eq!(worker.metadata["fingerprint"].as_str().unwrap().len(), 8);

        assert!(synthesize("the and", 3, |_| false).is_none());
    }
}
