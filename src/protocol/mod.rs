pub mod codec;
pub mod framing;
pub mod handshake;
pub mod packet;

pub use framing::{
    count_signal_packets, error_code, error_message, extract_complete, is_auth_switch,
    is_eof_packet, is_err_packet, is_local_infile, is_ok_packet, is_result_set, next_packet,
    packet_count, parse_ok_response, ps_response_complete,
};
pub use handshake::{
    build_change_user, build_com_quit, compute_auth_response, compute_token, custom_error,
    AuthSwitchRequest, ChangeUserRequest, ErrPacket, HandshakeResponse, InitialHandshake, OkPacket,
};
pub use codec::PacketCodec;
pub use packet::{capabilities, Command, Packet};
