//! String sanitizers used for identifiers coming from requests and for file names.

const ACCENTS: [(char, char); 22] = [
    ('á', 'a'),
    ('à', 'a'),
    ('ä', 'a'),
    ('â', 'a'),
    ('é', 'e'),
    ('è', 'e'),
    ('ë', 'e'),
    ('ê', 'e'),
    ('í', 'i'),
    ('ì', 'i'),
    ('ï', 'i'),
    ('î', 'i'),
    ('ó', 'o'),
    ('ò', 'o'),
    ('ö', 'o'),
    ('ô', 'o'),
    ('ú', 'u'),
    ('ù', 'u'),
    ('ü', 'u'),
    ('û', 'u'),
    ('ñ', 'n'),
    ('ç', 'c'),
];

fn fold_accent(c: char) -> char {
    let lower = c.to_lowercase().next().unwrap_or(c);
    ACCENTS
        .iter()
        .find(|(from, _)| *from == lower)
        .map(|(_, to)| *to)
        .unwrap_or(lower)
}

/// Lowercase `input`, fold accents and replace every character that is not
/// `a-z`, `0-9` or listed in `extra` by `pad`. Runs of `pad` collapse into one
/// and leading/trailing pads are removed.
pub fn encode_bad_chars(input: &str, pad: char, extra: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        let c = fold_accent(c);
        let keep = c.is_ascii_lowercase() || c.is_ascii_digit() || extra.contains(c);
        let c = if keep { c } else { pad };
        if c == pad && out.ends_with(pad) {
            continue;
        }
        out.push(c);
    }
    out.trim_matches(pad).to_string()
}

/// [`encode_bad_chars`] for file names: the extension after the last dot is
/// sanitized separately and kept.
pub fn encode_bad_chars_file(file: &str) -> String {
    match file.rsplit_once('.') {
        Some((stem, ext)) => {
            let stem = encode_bad_chars(stem, '_', "");
            let ext = encode_bad_chars(ext, '_', "");
            if ext.is_empty() {
                stem
            } else {
                format!("{}.{}", stem, ext)
            }
        }
        None => encode_bad_chars(file, '_', ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folds_accents_and_collapses_pads() {
        assert_eq!(encode_bad_chars("Àpp  Clientés!", '_', ""), "app_clientes");
        assert_eq!(encode_bad_chars("../etc/passwd", '_', ""), "etc_passwd");
        assert_eq!(encode_bad_chars("+foo -bar", ' ', "+-"), "+foo -bar");
    }

    #[test]
    fn file_names_keep_their_extension() {
        assert_eq!(encode_bad_chars_file("Mi Factura (1).PDF"), "mi_factura_1.pdf");
        assert_eq!(encode_bad_chars_file("README"), "readme");
    }
}
