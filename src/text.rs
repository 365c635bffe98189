use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;

static RE_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"http\S+|www\S+|https\S+").expect("valid url regex"));
static RE_MENTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"@\w+|#\w+").expect("valid mention regex"));
static RE_NON_LETTER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-záàâãéêíóôõúüç\s]").expect("valid letter regex"));

/// Tokens this short carry no signal.
const MIN_TOKEN_CHARS: usize = 3;

/// Portuguese stopwords (NLTK list).
const STOPWORDS_PT: &[&str] = &[
    "de", "a", "o", "que", "e", "é", "do", "da", "em", "um", "para", "com", "não", "uma", "os",
    "no", "se", "na", "por", "mais", "as", "dos", "como", "mas", "ao", "ele", "das", "à", "seu",
    "sua", "ou", "quando", "muito", "nos", "já", "eu", "também", "só", "pelo", "pela", "até",
    "isso", "ela", "entre", "depois", "sem", "mesmo", "aos", "seus", "quem", "nas", "me", "esse",
    "eles", "você", "essa", "num", "nem", "suas", "meu", "às", "minha", "numa", "pelos", "elas",
    "qual", "nós", "lhe", "deles", "essas", "esses", "pelas", "este", "dele", "tu", "te",
    "vocês", "vos", "lhes", "meus", "minhas", "teu", "tua", "teus", "tuas", "nosso", "nossa",
    "nossos", "nossas", "dela", "delas", "esta", "estes", "estas", "aquele", "aquela",
    "aqueles", "aquelas", "isto", "aquilo", "estou", "está", "estamos", "estão", "estive",
    "esteve", "estivemos", "estiveram", "estava", "estávamos", "estavam", "estivera",
    "estivéramos", "esteja", "estejamos", "estejam", "estivesse", "estivéssemos",
    "estivessem", "estiver", "estivermos", "estiverem", "hei", "há", "havemos", "hão", "houve",
    "houvemos", "houveram", "houvera", "houvéramos", "haja", "hajamos", "hajam", "houvesse",
    "houvéssemos", "houvessem", "houver", "houvermos", "houverem", "houverei", "houverá",
    "houveremos", "houverão", "houveria", "houveríamos", "houveriam", "sou", "somos", "são",
    "era", "éramos", "eram", "fui", "foi", "fomos", "foram", "fora", "fôramos", "seja",
    "sejamos", "sejam", "fosse", "fôssemos", "fossem", "for", "formos", "forem", "serei",
    "será", "seremos", "serão", "seria", "seríamos", "seriam", "tenho", "tem", "temos", "tém",
    "tinha", "tínhamos", "tinham", "tive", "teve", "tivemos", "tiveram", "tivera",
    "tivéramos", "tenha", "tenhamos", "tenham", "tivesse", "tivéssemos", "tivessem", "tiver",
    "tivermos", "tiverem", "terei", "terá", "teremos", "terão", "teria", "teríamos", "teriam",
];

static STOPWORDS: LazyLock<HashSet<&'static str>> =
    LazyLock::new(|| STOPWORDS_PT.iter().copied().collect());

/// Clean and tokenize a message body.
///
/// Lowercases, removes URLs, `@mentions` and `#hashtags`, keeps only (accented)
/// Latin letters and whitespace, then splits on whitespace and drops stopwords
/// and tokens of two characters or fewer. Absent or empty text yields no tokens.
pub fn normalize(text: Option<&str>) -> Vec<String> {
    let Some(text) = text else {
        return Vec::new();
    };
    if text.is_empty() {
        return Vec::new();
    }

    let lowered = text.to_lowercase();
    let without_urls = RE_URL.replace_all(&lowered, "");
    let without_mentions = RE_MENTION.replace_all(&without_urls, "");
    let letters_only = RE_NON_LETTER.replace_all(&without_mentions, "");

    letters_only
        .split_whitespace()
        .filter(|token| token.chars().count() >= MIN_TOKEN_CHARS)
        .filter(|token| !STOPWORDS.contains(token))
        .map(str::to_string)
        .collect()
}
