#![no_main]

use arbitrary::Arbitrary;
use browserchannel::chunk::{split_chunks, ChunkParser, ChunkStatus};
use libfuzzer_sys::fuzz_target;

#[derive(Arbitrary, Debug)]
struct Input {
    body: Vec<u8>,
    cuts: Vec<u16>,
}

fuzz_target!(|input: Input| {
    feed_in_pieces(input);
});

/// Feeding a growing buffer must yield the same chunks as one complete read
fn feed_in_pieces(input: Input) {
    let Input { body, cuts } = input;
    let mut cuts: Vec<usize> = cuts.into_iter().map(usize::from).collect();
    cuts.push(body.len());
    cuts.sort_unstable();

    let mut parser = ChunkParser::new();
    let mut chunks = Vec::new();
    let mut invalid = false;
    'feed: for cut in cuts {
        let end = cut.min(body.len());
        loop {
            match parser.next_chunk(&body[..end]) {
                ChunkStatus::Ready(chunk) => chunks.push(chunk),
                ChunkStatus::Incomplete => break,
                ChunkStatus::Invalid => {
                    invalid = true;
                    break 'feed;
                }
            }
        }
        assert!(parser.cursor() <= end);
    }

    if let Ok(text) = std::str::from_utf8(&body) {
        if let Some(whole) = split_chunks(text) {
            assert!(!invalid);
            assert_eq!(whole, chunks);
        }
    }
}
