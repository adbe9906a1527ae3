//! Client-side packet codec for tokio's `Framed`.
//!
//! Inbound, the client socket is framed into `Packet`s. Outbound there are
//! two shapes: packets the proxy authors itself (handshake, OK/ERR), and
//! buffer chains holding assembled backend replies that are already in
//! wire format and must keep their original headers and sequence numbers.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::buffer::BufferChain;

use super::packet::Packet;

#[derive(Debug, Default)]
pub struct PacketCodec;

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Ok(Packet::decode(src))
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode(dst);
        Ok(())
    }
}

/// Forward an assembled reply chain without reframing. Segments are copied
/// into the output in order; the chain is never flattened first.
impl Encoder<BufferChain> for PacketCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: BufferChain, dst: &mut BytesMut) -> Result<(), Self::Error> {
        for segment in item.segments() {
            dst.extend_from_slice(segment);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_roundtrip_through_codec() {
        let mut codec = PacketCodec;
        let mut wire = BytesMut::new();
        codec
            .encode(Packet::new(1, vec![0x03, b'S']), &mut wire)
            .unwrap();

        let decoded = codec.decode(&mut wire).unwrap().unwrap();
        assert_eq!(decoded.sequence_id, 1);
        assert_eq!(&decoded.payload[..], &[0x03, b'S']);
        assert!(codec.decode(&mut wire).unwrap().is_none());
    }

    #[test]
    fn test_chain_passes_through_unreframed() {
        let mut chain = BufferChain::from_bytes(Packet::new(4, vec![0x00]).to_vec());
        chain.append_bytes(Packet::new(5, vec![0xfe, 0, 0, 2, 0]).to_vec());

        let mut codec = PacketCodec;
        let mut wire = BytesMut::new();
        codec.encode(chain.clone(), &mut wire).unwrap();
        assert_eq!(wire.to_vec(), chain.to_vec());

        // Sequence numbers survive untouched.
        let first = codec.decode(&mut wire).unwrap().unwrap();
        let second = codec.decode(&mut wire).unwrap().unwrap();
        assert_eq!(first.sequence_id, 4);
        assert_eq!(second.sequence_id, 5);
    }
}
