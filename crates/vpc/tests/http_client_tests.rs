//! HTTP client tests against a mock EC2 endpoint.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use vpc::ec2::{Ec2Api, Filter, HttpEc2, Tag};
use vpc::{BackoffPolicy, Remote, RemoteError, VpcError};

fn client(server: &MockServer) -> HttpEc2 {
    HttpEc2::new("AKIDEXAMPLE", "secret", "us-east-1")
        .unwrap()
        .with_endpoint(server.uri())
}

fn fast_policy() -> BackoffPolicy {
    BackoffPolicy {
        min_wait: Duration::from_millis(5),
        max_interval: Duration::from_millis(20),
        throttle_ceiling: Duration::from_secs(5),
    }
}

fn error_body(code: &str) -> serde_json::Value {
    json!({ "Error": { "Code": code, "Message": format!("{code} happened") } })
}

// ============================================================================
// Request shape
// ============================================================================

#[tokio::test]
async fn test_action_request_shape() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/"))
        .and(query_param("Action", "CreateTags"))
        .and(query_param("Version", "2016-11-15"))
        .and(header("X-Amz-Access-Key-Id", "AKIDEXAMPLE"))
        .and(body_partial_json(json!({
            "Resources": ["vpc-1"],
            "Tags": [{ "Key": "Name", "Value": "ci" }]
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    client(&server)
        .create_tags(&["vpc-1".to_string()], &[Tag::new("Name", "ci")])
        .await
        .unwrap();
}

#[tokio::test]
async fn test_describe_sends_filters_and_decodes() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(query_param("Action", "DescribeVpcs"))
        .and(body_partial_json(json!({
            "Filters": [{ "Name": "tag:Name", "Values": ["ci"] }]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "Vpcs": [{
                "VpcId": "vpc-1",
                "CidrBlock": "10.0.0.0/20",
                "State": "available",
                "Tags": [{ "Key": "Name", "Value": "ci" }]
            }]
        })))
        .mount(&server)
        .await;

    let page = client(&server)
        .describe_vpcs(&[Filter::tag("Name", "ci")], None)
        .await
        .unwrap();
    assert!(page.next_token.is_none());
    assert_eq!(page.items.len(), 1);
    assert_eq!(page.items[0].vpc_id, "vpc-1");
    assert_eq!(page.items[0].cidr_block, "10.0.0.0/20");
    assert!(page.items[0].dhcp_options_id.is_none());
}

// ============================================================================
// Error classification
// ============================================================================

#[tokio::test]
async fn test_error_codes_are_classified() {
    let server = MockServer::start().await;
    Mock::given(query_param("Action", "DeleteVpc"))
        .respond_with(ResponseTemplate::new(400).set_body_json(error_body("InvalidVpcID.NotFound")))
        .mount(&server)
        .await;
    Mock::given(query_param("Action", "DeleteSubnet"))
        .respond_with(ResponseTemplate::new(400).set_body_json(error_body("DependencyViolation")))
        .mount(&server)
        .await;
    Mock::given(query_param("Action", "DeleteRouteTable"))
        .respond_with(ResponseTemplate::new(503).set_body_json(error_body("RequestLimitExceeded")))
        .mount(&server)
        .await;
    Mock::given(query_param("Action", "DeleteSecurityGroup"))
        .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
        .mount(&server)
        .await;
    Mock::given(query_param("Action", "DeleteInternetGateway"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let api = client(&server);

    let err = api.delete_vpc("vpc-1").await.unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(err.code(), Some("InvalidVpcID.NotFound"));

    let err = api.delete_subnet("subnet-1").await.unwrap_err();
    assert!(matches!(&err, RemoteError::Api { code, .. } if code == "DependencyViolation"));

    assert!(api.delete_route_table("rtb-1").await.unwrap_err().is_throttling());
    assert!(api.delete_security_group("sg-1").await.unwrap_err().is_throttling());
    assert!(api.delete_internet_gateway("igw-1").await.unwrap_err().is_not_found());
}

// ============================================================================
// Through the retrying layer
// ============================================================================

#[tokio::test]
async fn test_call_paged_follows_next_token() {
    let server = MockServer::start().await;
    let subnet = |id: &str| {
        json!({
            "SubnetId": id,
            "VpcId": "vpc-1",
            "CidrBlock": "10.0.0.0/24",
            "AvailabilityZone": "us-east-1a"
        })
    };
    Mock::given(query_param("Action", "DescribeSubnets"))
        .and(body_partial_json(json!({ "NextToken": "page-2" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "Subnets": [subnet("subnet-3")],
            "NextToken": ""
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(query_param("Action", "DescribeSubnets"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "Subnets": [subnet("subnet-1"), subnet("subnet-2")],
            "NextToken": "page-2"
        })))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;

    let remote = Remote::new(Arc::new(client(&server)));
    let filters = [Filter::vpc("vpc-1")];
    let subnets = remote
        .call_paged("DescribeSubnets", |api, token| {
            api.describe_subnets(&filters, token)
        })
        .await
        .unwrap();

    let ids: Vec<_> = subnets.iter().map(|s| s.subnet_id.as_str()).collect();
    assert_eq!(ids, vec!["subnet-1", "subnet-2", "subnet-3"]);
}

#[tokio::test]
async fn test_throttled_call_is_retried() {
    let server = MockServer::start().await;
    Mock::given(query_param("Action", "DeleteVpc"))
        .respond_with(ResponseTemplate::new(400).set_body_json(error_body("Throttling")))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(query_param("Action", "DeleteVpc"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let remote = Remote::new(Arc::new(client(&server))).with_policy(fast_policy());
    remote
        .call("DeleteVpc", |api| api.delete_vpc("vpc-1"))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_non_throttling_error_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(query_param("Action", "DeleteVpc"))
        .respond_with(ResponseTemplate::new(400).set_body_json(error_body("DependencyViolation")))
        .expect(1)
        .mount(&server)
        .await;

    let remote = Remote::new(Arc::new(client(&server))).with_policy(fast_policy());
    let err = remote
        .call("DeleteVpc", |api| api.delete_vpc("vpc-1"))
        .await
        .unwrap_err();
    assert!(matches!(&err, VpcError::Remote { operation, .. } if operation == "DeleteVpc"));
    assert_eq!(err.remote_code(), Some("DependencyViolation"));
}
