//! Decodes a canned Scan Code Set 2 byte stream and prints the resulting
//! matrix transitions, one poll per line.

use ps2_set2_matrix::{col, row, Ps2BusError, Ps2Decoder, Ps2Source, ScanOutcome, PAUSE};

struct SliceSource<'a> {
    bytes: &'a [u8],
}

impl Ps2Source for SliceSource<'_> {
    fn recv(&mut self) -> Result<Option<u8>, Ps2BusError> {
        match self.bytes.split_first() {
            Some((&b, rest)) => {
                self.bytes = rest;
                Ok(Some(b))
            }
            None => Ok(None),
        }
    }
}

fn main() {
    // "A" tap, Num-Lock-on Up arrow tap, Pause.
    let stream: &[u8] = &[
        0x1C, 0xF0, 0x1C, // A make, A break
        0xE0, 0x12, 0xE0, 0x75, // E0 12 prefix (swallowed), Up make
        0xE0, 0xF0, 0x75, 0xE0, 0xF0, 0x12, // Up break, E0 F0 12 postfix
        0xE1, 0x14, 0x77, 0xE1, 0xF0, 0x14, 0xF0, 0x77, // Pause
    ];

    let mut source = SliceSource { bytes: stream };
    let mut decoder = Ps2Decoder::new();

    // One extra poll so the Pause pseudo-break is visible.
    for poll in 0..=stream.len() {
        let outcome = decoder.scan(&mut source);
        if decoder.matrix().is_modified() {
            let pause = decoder.matrix().is_on(row(PAUSE), col(PAUSE));
            println!(
                "poll {poll:2}: matrix changed, {} keys down{}",
                decoder.matrix().key_count(),
                if pause { " (pause pulse)" } else { "" },
            );
        }
        if outcome != ScanOutcome::Idle {
            println!("poll {poll:2}: {outcome:?}");
        }
    }

    println!("\nfinal matrix:\n{}", decoder.matrix());
}
