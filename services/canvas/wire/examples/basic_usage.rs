//! Basic usage example for the canvas wire protocol.

use bytes::{Bytes, BytesMut};
use canvas_wire::{Frame, FrameDecoder, SyncTarget, CURRENT_VERSION};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Canvas Wire Protocol Example ===\n");

    // 1. Encode a handshake followed by a small transfer
    println!("1. Encoding frames...");
    let frames = vec![
        Frame::Version(CURRENT_VERSION),
        Frame::TransferSync(SyncTarget::Any),
        Frame::TransferStart {
            transfer_id: 1,
            total_size: 5,
        },
        Frame::TransferChunk {
            transfer_id: 1,
            bytes: Bytes::from_static(b"hello"),
        },
        Frame::TransferStop { transfer_id: 1 },
    ];

    let mut stream = BytesMut::new();
    for frame in &frames {
        frame.encode(&mut stream);
    }
    println!("   Encoded {} frames into {} bytes", frames.len(), stream.len());

    // 2. Decode them back, feeding three bytes at a time
    println!("\n2. Decoding in small pieces...");
    let mut decoder = FrameDecoder::new();
    let mut buf = BytesMut::new();
    for piece in stream.chunks(3) {
        buf.extend_from_slice(piece);
        while let Some(frame) = decoder.decode(&mut buf)? {
            println!("   {:?} -> {:?}", frame.frame_type(), frame);
        }
    }

    println!("\n=== Example completed successfully! ===");
    Ok(())
}
