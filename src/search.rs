use crate::models::Transaction;

fn fold_char(c: char) -> Option<char> {
    let folded = match c {
        'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' | 'ā' | 'ă' | 'ą' => 'a',
        'ç' | 'ć' | 'ĉ' | 'ċ' | 'č' => 'c',
        'ď' => 'd',
        'è' | 'é' | 'ê' | 'ë' | 'ē' | 'ĕ' | 'ė' | 'ę' | 'ě' => 'e',
        'ĝ' | 'ğ' | 'ġ' | 'ģ' => 'g',
        'ì' | 'í' | 'î' | 'ï' | 'ĩ' | 'ī' | 'ĭ' | 'į' => 'i',
        'ñ' | 'ń' | 'ņ' | 'ň' => 'n',
        'ò' | 'ó' | 'ô' | 'õ' | 'ö' | 'ō' | 'ŏ' | 'ő' => 'o',
        'ŕ' | 'ř' => 'r',
        'ś' | 'ŝ' | 'ş' | 'š' => 's',
        'ţ' | 'ť' => 't',
        'ù' | 'ú' | 'û' | 'ü' | 'ũ' | 'ū' | 'ŭ' | 'ů' | 'ű' | 'ų' => 'u',
        'ý' | 'ÿ' => 'y',
        'ź' | 'ż' | 'ž' => 'z',
        // combining diacritical marks
        '\u{0300}'..='\u{036f}' => return None,
        other => other,
    };
    Some(folded)
}

/// Lowercase and strip diacritics so `Café` matches `cafe`.
pub fn normalize(s: &str) -> String {
    s.to_lowercase().chars().filter_map(fold_char).collect()
}

pub fn matches_field(value: Option<&str>, query: &str) -> bool {
    if query.trim().is_empty() {
        return true;
    }
    normalize(value.unwrap_or("")).contains(&normalize(query))
}

/// Match a query against category, subcategory, note, amount and date.
pub fn matches_search(tx: &Transaction, query: &str) -> bool {
    let needle = normalize(query.trim());
    if needle.is_empty() {
        return true;
    }
    let haystack = [
        tx.category.clone().unwrap_or_default(),
        tx.subcategory.clone().unwrap_or_default(),
        tx.notes.clone().unwrap_or_default(),
        tx.amount.to_string(),
        tx.date.clone(),
    ]
    .iter()
    .map(|f| normalize(f))
    .collect::<Vec<_>>()
    .join(" ");
    haystack.contains(&needle)
}
