/// Splits `text` into word-aligned chunks.
///
/// Words are appended until the joined chunk reaches `target_chars`
/// characters; the chunk is then closed. The remainder becomes the last,
/// possibly short, chunk.
pub fn chunk_text(text: &str, target_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_chars = 0usize;

    for word in text.split_whitespace() {
        if !current.is_empty() {
            current.push(' ');
            current_chars += 1;
        }
        current.push_str(word);
        current_chars += word.chars().count();

        if current_chars >= target_chars {
            chunks.push(std::mem::take(&mut current));
            current_chars = 0;
        }
    }

    if !current.is_empty() {
        chunks.push(current);
    }

    chunks
}
