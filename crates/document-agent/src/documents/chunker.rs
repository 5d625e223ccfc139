//! Structure-aware markdown splitting

/// Tried in order; the first one present in an oversized piece is used.
const SEPARATORS: &[&str] = &[
    "\n## ",
    "\n### ",
    "\n#### ",
    "\n##### ",
    "\n###### ",
    "```\n\n",
    "\n\n***\n\n",
    "\n\n---\n\n",
    "\n\n___\n\n",
    "\n\n",
    "\n",
    " ",
    "",
];

/// Splits markdown into chunks of at most `chunk_size` characters, without overlap.
#[derive(Debug, Clone)]
pub struct MarkdownSplitter {
    chunk_size: usize,
}

impl MarkdownSplitter {
    pub fn new(chunk_size: usize) -> Self {
        Self { chunk_size: chunk_size.max(1) }
    }

    pub fn split(&self, text: &str) -> Vec<String> {
        self.split_with(text, SEPARATORS)
            .into_iter()
            .map(|chunk| chunk.trim().to_string())
            .filter(|chunk| !chunk.is_empty())
            .collect()
    }

    fn split_with(&self, text: &str, separators: &[&str]) -> Vec<String> {
        if text.chars().count() <= self.chunk_size {
            return vec![text.to_string()];
        }

        let position = separators
            .iter()
            .position(|sep| sep.is_empty() || text.contains(sep))
            .unwrap_or(separators.len().saturating_sub(1));
        let separator = separators.get(position).copied().unwrap_or("");
        let rest = separators.get(position + 1..).unwrap_or(&[]);

        let mut chunks = Vec::new();
        let mut current = String::new();
        let mut current_len = 0;

        for piece in pieces(text, separator) {
            let piece_len = piece.chars().count();

            if piece_len > self.chunk_size {
                if !current.is_empty() {
                    chunks.push(std::mem::take(&mut current));
                    current_len = 0;
                }
                chunks.extend(self.split_with(piece, rest));
                continue;
            }

            if current_len + piece_len > self.chunk_size {
                chunks.push(std::mem::take(&mut current));
                current_len = 0;
            }
            current.push_str(piece);
            current_len += piece_len;
        }

        if !current.is_empty() {
            chunks.push(current);
        }
        chunks
    }
}

/// Splits before every occurrence of `separator`, keeping it at the head of
/// the following piece. An empty separator yields single characters.
fn pieces<'a>(text: &'a str, separator: &str) -> Vec<&'a str> {
    if separator.is_empty() {
        return text.char_indices().map(|(i, c)| &text[i..i + c.len_utf8()]).collect();
    }

    let mut out = Vec::new();
    let mut start = 0;
    for (index, _) in text.match_indices(separator) {
        if index > start {
            out.push(&text[start..index]);
        }
        start = index;
    }
    if start < text.len() {
        out.push(&text[start..]);
    }
    out
}
