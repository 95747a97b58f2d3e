//! 配额装饰器的边界性质：任意输入下计数器从不越界，恰好等于上限的数据总能通过。

use futures::executor::block_on;
use proptest::prelude::*;
use spark_channel::{ChannelError, stream::MaxMessageSizeStream};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn reads_succeed_exactly_up_to_the_limit(len in 0usize..4096, limit in 0u64..4096) {
        let data = vec![0x5au8; len];
        let mut stream = MaxMessageSizeStream::new(data.as_slice(), limit, 0);
        let mut out = Vec::new();
        let result = block_on(stream.read_to_end(&mut out));

        prop_assert!(stream.bytes_read() <= limit);
        if len as u64 <= limit {
            prop_assert_eq!(result.expect("配额内读取成功"), len);
            prop_assert_eq!(out.len(), len);
        } else {
            let err = ChannelError::from_io("read", result.expect_err("超过配额应失败"));
            prop_assert!(err.is_quota_exceeded());
            prop_assert_eq!(out.len() as u64, limit);
        }
    }

    #[test]
    fn chunked_writes_never_commit_past_the_limit(
        chunks in proptest::collection::vec(0usize..512, 0..16),
        limit in 0u64..4096,
    ) {
        let mut stream = MaxMessageSizeStream::new(Vec::new(), 0, limit);
        let mut accepted = 0u64;
        let mut rejected = false;
        for chunk in &chunks {
            let payload = vec![0xa5u8; *chunk];
            match block_on(stream.write_all(&payload)) {
                Ok(()) => accepted += *chunk as u64,
                Err(err) => {
                    prop_assert!(ChannelError::from_io("write", err).is_quota_exceeded());
                    prop_assert!(accepted + *chunk as u64 > limit);
                    rejected = true;
                    break;
                }
            }
        }

        prop_assert!(stream.bytes_written() <= limit);
        prop_assert_eq!(stream.bytes_written(), accepted);
        prop_assert_eq!(stream.get_ref().len() as u64, accepted, "被拒绝的块不会部分写入");
        let total: u64 = chunks.iter().map(|chunk| *chunk as u64).sum();
        prop_assert_eq!(rejected, total > limit);
    }
}
