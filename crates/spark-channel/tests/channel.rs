//! 端到端通道：请求-应答、连接复用、配额、故障传播、中止与单向分层。

mod common;

use std::{sync::Arc, time::Duration};

use spark_channel::{
    BindingConfig, Channel, ChannelFactory, ChannelShape, CommunicationObject, CommunicationState, CustomBinding,
    Message,
    binding::{MessageEncodingBindingElement, OneWayBindingElement},
    encoding::BinaryMessageEncoder,
    error::{ErrorCategory, codes},
    stream::upgrade::{IdentityUpgrade, RemoteSecurity, StreamUpgradeProvider},
};
use tracing_test::traced_test;

use common::{MemoryConnector, MemoryTransportBindingElement, address, deadline};

async fn open_factory(connector: &MemoryConnector, shape: ChannelShape) -> Arc<dyn ChannelFactory> {
    let mut elements: Vec<Arc<dyn spark_channel::BindingElement>> = Vec::new();
    if shape == ChannelShape::Output {
        elements.push(Arc::new(OneWayBindingElement::new()));
    }
    elements.push(Arc::new(MessageEncodingBindingElement::binary()));
    elements.push(Arc::new(MemoryTransportBindingElement::new(connector.clone())));
    let factory = CustomBinding::new(elements)
        .build_channel_factory(shape)
        .expect("绑定可构建");
    factory.open(deadline()).await.expect("工厂打开");
    factory
}

async fn open_channel(factory: &Arc<dyn ChannelFactory>, path: &str) -> Arc<dyn Channel> {
    let channel = factory.create_channel(address(path)).expect("创建通道");
    channel.open(deadline()).await.expect("通道打开");
    channel
}

#[tokio::test]
async fn request_reply_reuses_one_connection() {
    let connector = MemoryConnector::binary();
    let factory = open_factory(&connector, ChannelShape::Request).await;
    let first = open_channel(&factory, "echo").await;
    let second = open_channel(&factory, "echo").await;

    let reply = first
        .request(Message::new("echo", "hello"), None)
        .await
        .expect("回显请求");
    assert_eq!(reply.action(), "echo");
    assert_eq!(reply.body().as_ref(), b"hello");

    second
        .request(Message::new("echo", "again"), None)
        .await
        .expect("第二个通道复用连接");
    first
        .request(Message::new("echo", "third"), None)
        .await
        .expect("再次请求");
    assert_eq!(connector.connections(), 1, "顺序请求共享同一条池化连接");

    let err = first
        .send(Message::new("echo", "x"), None)
        .await
        .expect_err("请求-应答通道不支持单向发送");
    assert_eq!(err.code(), codes::UNSUPPORTED);
    factory.close(deadline()).await.expect("工厂关闭");
}

#[tokio::test]
async fn oversized_reply_is_a_quota_error_and_the_channel_survives() {
    let connector = MemoryConnector::binary();
    let factory = open_factory(&connector, ChannelShape::Request).await;
    let channel = open_channel(&factory, "big").await;

    let err = channel
        .request(Message::new("big", "70000"), None)
        .await
        .expect_err("应答超过 64 KiB 入站上限");
    assert!(err.is_quota_exceeded());
    assert_eq!(channel.state(), CommunicationState::Opened, "配额错误不使通道故障");

    let reply = channel
        .request(Message::new("big", "1024"), None)
        .await
        .expect("限额内的应答正常到达");
    assert_eq!(reply.body().len(), 1024);
    assert_eq!(connector.connections(), 2, "超限后的连接被丢弃");
}

#[tokio::test]
async fn service_faults_and_dropped_connections_fail_only_the_request() {
    let connector = MemoryConnector::binary();
    let factory = open_factory(&connector, ChannelShape::Request).await;
    let channel = open_channel(&factory, "faulty").await;

    let err = channel
        .request(Message::new("fault", ""), None)
        .await
        .expect_err("服务端返回 Fault 记录");
    assert_eq!(err.category(), &ErrorCategory::Communication);
    assert!(err.message().contains("rejected by service"));

    let err = channel
        .request(Message::new("close", ""), None)
        .await
        .expect_err("服务端未应答即关闭连接");
    assert_eq!(err.category(), &ErrorCategory::Communication);

    assert_eq!(channel.state(), CommunicationState::Opened);
    channel
        .request(Message::new("echo", "still alive"), None)
        .await
        .expect("通道仍可继续使用");
}

#[traced_test]
#[tokio::test]
async fn undecodable_reply_faults_the_channel() {
    let connector = MemoryConnector::binary();
    let factory = open_factory(&connector, ChannelShape::Request).await;
    let channel = open_channel(&factory, "garbage").await;

    let err = channel
        .request(Message::new("garbage", ""), None)
        .await
        .expect_err("应答无法解码");
    assert_eq!(err.category(), &ErrorCategory::ProtocolViolation);
    assert_eq!(channel.state(), CommunicationState::Faulted);
    assert!(logs_contain("request failed fatally, faulting channel"));

    let err = channel
        .request(Message::new("echo", ""), None)
        .await
        .expect_err("故障通道拒绝请求");
    assert_eq!(err.category(), &ErrorCategory::Communication);
    channel.close(deadline()).await.expect("故障通道关闭等价于中止");
    assert_eq!(channel.state(), CommunicationState::Closed);
}

#[tokio::test]
async fn silent_service_times_out_and_abort_cancels_in_flight_requests() {
    let connector = MemoryConnector::binary();
    let factory = open_factory(&connector, ChannelShape::Request).await;
    let channel = open_channel(&factory, "hang").await;

    let err = channel
        .request(Message::new("hang", ""), Some(Duration::from_millis(100)))
        .await
        .expect_err("服务端不应答");
    assert!(err.is_timeout());

    let pending = {
        let channel = Arc::clone(&channel);
        tokio::spawn(async move {
            channel
                .request(Message::new("hang", ""), Some(Duration::from_secs(30)))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    channel.abort();
    let err = tokio::time::timeout(Duration::from_secs(5), pending)
        .await
        .expect("中止后请求应立即结束")
        .expect("请求任务不应 panic")
        .expect_err("在途请求被中止");
    assert_eq!(err.category(), &ErrorCategory::Aborted);
    assert_eq!(channel.state(), CommunicationState::Closed);
}

#[tokio::test]
async fn graceful_close_waits_for_in_flight_requests() {
    let connector = MemoryConnector::binary();
    let factory = open_factory(&connector, ChannelShape::Request).await;
    let channel = open_channel(&factory, "slow").await;

    let pending = {
        let channel = Arc::clone(&channel);
        tokio::spawn(async move { channel.request(Message::new("slow", "200"), None).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    channel.close(deadline()).await.expect("在途请求完成后通道关闭");
    assert_eq!(channel.state(), CommunicationState::Closed);
    let reply = pending
        .await
        .expect("请求任务不应 panic")
        .expect("优雅关闭不打断在途请求");
    assert_eq!(reply.body().as_ref(), b"200");

    let channel = open_channel(&factory, "slow").await;
    let pending = {
        let channel = Arc::clone(&channel);
        tokio::spawn(async move { channel.request(Message::new("slow", "5000"), None).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    let err = channel
        .close(spark_channel::Deadline::after(Duration::from_millis(100)))
        .await
        .expect_err("关闭截止时间先于应答到达");
    assert!(err.is_timeout());
    assert_eq!(channel.state(), CommunicationState::Closed);
    let err = tokio::time::timeout(Duration::from_secs(5), pending)
        .await
        .expect("关闭超时后在途请求被中止")
        .expect("请求任务不应 panic")
        .expect_err("在途请求被中止");
    assert_eq!(err.category(), &ErrorCategory::Aborted);
}

#[tokio::test]
async fn closing_the_factory_closes_its_channels() {
    let connector = MemoryConnector::binary();
    let factory = open_factory(&connector, ChannelShape::Request).await;
    let channels = vec![
        open_channel(&factory, "a").await,
        open_channel(&factory, "b").await,
    ];
    channels[0]
        .request(Message::new("echo", ""), None)
        .await
        .expect("请求成功");

    factory.close(deadline()).await.expect("工厂关闭");
    for channel in &channels {
        assert_eq!(channel.state(), CommunicationState::Closed);
    }
    let err = factory
        .create_channel(address("late"))
        .expect_err("关闭后的工厂不再创建通道");
    assert_eq!(err.category(), &ErrorCategory::Aborted);

    let foreign = spark_channel::EndpointAddress::parse("other://service:9000/x").expect("地址合法");
    let reopened = open_factory(&connector, ChannelShape::Request).await;
    let err = reopened
        .create_channel(foreign)
        .expect_err("方案不匹配");
    assert_eq!(err.code(), codes::CONFIGURATION);
}

#[tokio::test]
async fn configured_binding_negotiates_identities() {
    let config = BindingConfig::from_toml_str(
        r#"
        [timeouts]
        send_ms = 2000

        [upgrade]
        identity = "client"
        expected_remote = "service"
        "#,
    )
    .expect("配置合法");
    let connector = MemoryConnector::new(
        Arc::new(BinaryMessageEncoder),
        Some(StreamUpgradeProvider::new(IdentityUpgrade::new("service"))),
    );
    let transport = MemoryTransportBindingElement::new(connector.clone()).with_settings(config.transport.clone());
    let binding = CustomBinding::from_config(&config, Arc::new(transport)).expect("配置生成绑定");
    let factory = binding
        .build_channel_factory(ChannelShape::Request)
        .expect("构建工厂");
    factory.open(deadline()).await.expect("工厂打开");

    let channel = open_channel(&factory, "secure").await;
    assert!(channel.property::<RemoteSecurity>().is_none(), "握手前没有远端身份");
    channel
        .request(Message::new("echo", "hi"), None)
        .await
        .expect("升级后请求成功");
    let security = channel.property::<RemoteSecurity>().expect("握手后公布远端身份");
    assert_eq!(security.identity(), "service");
    assert_eq!(channel.timeouts().send, Duration::from_secs(2), "超时沿绑定向下传递");

    let mismatched = BindingConfig::from_toml_str("[upgrade]\nidentity = \"client\"\nexpected_remote = \"impostor\"\n")
        .expect("配置合法");
    let binding = CustomBinding::from_config(&mismatched, Arc::new(MemoryTransportBindingElement::new(connector)))
        .expect("配置生成绑定");
    let factory = binding
        .build_channel_factory(ChannelShape::Request)
        .expect("构建工厂");
    factory.open(deadline()).await.expect("工厂打开");
    let channel = open_channel(&factory, "secure").await;
    let err = channel
        .request(Message::new("echo", "hi"), None)
        .await
        .expect_err("远端身份不符");
    assert_eq!(err.code(), codes::UPGRADE_FAILED);
}

#[tokio::test]
async fn one_way_send_requires_an_empty_acknowledgement() {
    let connector = MemoryConnector::binary();
    let factory = open_factory(&connector, ChannelShape::Output).await;
    assert_eq!(factory.shape(), ChannelShape::Output);
    let channel = open_channel(&factory, "notify").await;
    assert_eq!(channel.shape(), ChannelShape::Output);

    channel
        .send(Message::new("notify", "ping"), None)
        .await
        .expect("服务端以空消息确认");
    let err = channel
        .send(Message::new("echo", "ping"), None)
        .await
        .expect_err("非空应答违反单向约定");
    assert_eq!(err.category(), &ErrorCategory::ProtocolViolation);
    let err = channel
        .request(Message::new("echo", ""), None)
        .await
        .expect_err("单向通道不支持请求");
    assert_eq!(err.code(), codes::UNSUPPORTED);
    factory.close(deadline()).await.expect("关闭单向工厂");
    assert_eq!(channel.state(), CommunicationState::Closed);
}

#[tokio::test]
async fn inner_fault_propagates_to_the_one_way_channel() {
    let connector = MemoryConnector::binary();
    let factory = open_factory(&connector, ChannelShape::Output).await;
    let channel = open_channel(&factory, "garbage").await;

    let err = channel
        .send(Message::new("garbage", ""), None)
        .await
        .expect_err("内层应答无法解码");
    assert_eq!(err.category(), &ErrorCategory::ProtocolViolation);
    assert_eq!(channel.state(), CommunicationState::Faulted, "内层故障传播到外层");
}
