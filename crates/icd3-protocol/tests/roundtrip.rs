use icd3_protocol::{decode_frame, encode_frame, Command, Frame, ResultCode};
use proptest::prelude::*;

fn arb_command() -> impl Strategy<Value = Command> {
    prop_oneof![
        Just(Command::Read),
        Just(Command::Write),
        Just(Command::Interrupt),
    ]
}

proptest! {
    #[test]
    fn encode_decode_roundtrips(
        device_id in any::<u32>(),
        command in arb_command(),
        address in any::<u64>(),
        length in any::<u32>(),
        data in proptest::collection::vec(any::<u8>(), 64..=64),
        result in any::<u32>(),
    ) {
        let mut frame = Frame::new(device_id, command, address, length);
        frame.data.copy_from_slice(&data);
        frame.result = ResultCode(result);

        let bytes = encode_frame(&frame);
        prop_assert_eq!(bytes.len(), 92);
        let decoded = decode_frame(&bytes).unwrap();
        prop_assert_eq!(decoded, frame);
    }
}
