use answerpipe::evidence::Source;
use answerpipe::verify::{parse_markers, verify};
use proptest::prelude::*;

const WORDS: &[&str] = &[
    "leonardo", "painted", "mona", "lisa", "louvre", "paris", "florence", "portrait", "purple",
    "unicorn", "lottery", "martian", "the", "in", "1503",
];

fn sources() -> Vec<Source> {
    vec![
        Source {
            index: 1,
            url: "https://museum.example/mona-lisa".to_string(),
            title: "Mona Lisa".to_string(),
            text: "Leonardo painted the Mona Lisa portrait in Florence around 1503.".to_string(),
        },
        Source {
            index: 2,
            url: "https://louvre.example/".to_string(),
            title: "Louvre".to_string(),
            text: "The portrait hangs in the Louvre in Paris.".to_string(),
        },
    ]
}

fn sentence() -> impl Strategy<Value = String> {
    (
        prop::collection::vec(prop::sample::select(WORDS), 1..8),
        prop::collection::vec(0usize..6, 0..3),
    )
        .prop_map(|(words, markers)| {
            let marks: String = markers.iter().map(|m| format!("[{m}]")).collect();
            format!("{} {marks}.", words.join(" "))
        })
}

proptest! {
    #[test]
    fn citations_and_markers_always_point_into_the_sources(
        sentences in prop::collection::vec(sentence(), 1..6),
        threshold in 0.1f32..0.9,
    ) {
        let srcs = sources();
        let draft = sentences.join(" ");
        let v = verify(&draft, &srcs, threshold);

        for c in &v.citations {
            prop_assert!(srcs.iter().any(|s| s.url == c.url));
        }
        let (_, markers) = parse_markers(&v.text);
        for m in markers {
            prop_assert!(m >= 1 && m <= v.citations.len(), "marker {} in {:?}", m, v.text);
        }
        if v.all_removed() {
            prop_assert!(v.citations.is_empty());
        }
    }
}
