use next_token::{TextTokenizer, VocabTokenizer};

fn vocab(tokens: &[&str]) -> VocabTokenizer {
    VocabTokenizer::new(tokens.iter().map(|t| t.to_string()).collect())
}

#[test]
fn longest_match_wins() {
    let tokenizer = vocab(&["<unk>", "h", "e", "he", "hello", "l", "o", " ", " world"]);
    let ids = tokenizer.encode("hello world", false).unwrap();
    assert_eq!(ids, vec![4, 8]);
    assert_eq!(tokenizer.decode(&ids, false).unwrap(), "hello world");
}

#[test]
fn unknown_characters_map_to_unk() {
    let tokenizer = vocab(&["<unk>", "a"]);
    let ids = tokenizer.encode("a天a", false).unwrap();
    assert_eq!(ids, vec![1, 0, 1]);
}

#[test]
fn no_unk_is_an_error() {
    let tokenizer = vocab(&["a", "b"]);
    assert!(tokenizer.encode("abc", false).is_err());
}

#[test]
fn special_tokens_only_when_asked() {
    let tokenizer = vocab(&["<unk>", "<s>", "hi"]);
    assert_eq!(tokenizer.encode("hi", false).unwrap(), vec![2]);
    assert_eq!(tokenizer.encode("hi", true).unwrap(), vec![1, 2]);
}

#[test]
fn special_tokens_are_not_matched_from_text() {
    let tokenizer = vocab(&["<unk>", "<s>", "<", "s", ">"]);
    assert_eq!(tokenizer.encode("<s>", false).unwrap(), vec![2, 3, 4]);
}

#[test]
fn decode_can_skip_specials() {
    let tokenizer = vocab(&["<unk>", "<s>", "</s>", "ok"]);
    assert_eq!(tokenizer.decode(&[1, 3, 2], true).unwrap(), "ok");
    assert_eq!(tokenizer.decode(&[1, 3, 2], false).unwrap(), "<s>ok</s>");
}

#[test]
fn ids_past_the_vocab_decode_to_nothing() {
    let tokenizer = vocab(&["<unk>", "foo"]);
    assert_eq!(tokenizer.decode(&[7], true).unwrap(), "");
    assert_eq!(tokenizer.decode(&[1, 7, 1], false).unwrap(), "foofoo");
}

#[test]
fn markup_tokens_are_plain_text() {
    let tokenizer = vocab(&["<unk>", "<s>", "<br>", "a"]);
    let ids = tokenizer.encode("a<br>a", false).unwrap();
    assert_eq!(ids, vec![3, 2, 3]);
    assert_eq!(tokenizer.decode(&ids, true).unwrap(), "a<br>a");
}

#[test]
fn vocab_size_reports_number_of_tokens() {
    let tokenizer = vocab(&["<unk>", "foo", "bar"]);
    assert_eq!(tokenizer.vocab_size(), 3);
}

#[test]
fn contains_checks_presence() {
    let tokenizer = vocab(&["<unk>", "foo"]);
    assert!(tokenizer.contains("foo"));
    assert!(!tokenizer.contains("bar"));
}

#[test]
fn save_and_reload() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vocab.txt");
    let tokenizer = vocab(&["<unk>", " the", "\n", "x"]);
    tokenizer.save(&path).unwrap();
    let reloaded = VocabTokenizer::from_file(&path).unwrap();
    assert_eq!(reloaded.vocab_size(), 4);
    assert_eq!(reloaded.token(1), Some(" the"));
    assert_eq!(reloaded.token(2), Some("\n"));
}
