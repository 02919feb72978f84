//! HTTP client for the EC2 networking API.
//!
//! Every operation is a `POST {endpoint}/?Action=<Op>&Version=2016-11-15`
//! carrying PascalCase JSON parameters.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::models::{
    Address, DhcpConfiguration, DhcpOptions, Filter, InternetGateway, NatGateway,
    NetworkInterface, Page, Route, RouteTable, SecurityGroup, SecurityRule, Subnet, Tag, Vpc,
    VpcAttribute, VpcPeering, VpnGateway,
};
use super::Ec2Api;
use crate::error::RemoteError;

/// Default timeout for API requests.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// API version sent with every action.
const API_VERSION: &str = "2016-11-15";

/// EC2 API over HTTP.
#[derive(Clone)]
pub struct HttpEc2 {
    /// HTTP client.
    client: Client,
    /// Access key id, sent with every request.
    access_key_id: String,
    /// Secret access key. Request signing happens in the endpoint's signing proxy.
    #[allow(dead_code)]
    secret_access_key: String,
    /// Region, e.g. "us-east-1".
    region: String,
    /// Endpoint override.
    endpoint: Option<String>,
}

impl HttpEc2 {
    /// Create a new client.
    ///
    /// # Errors
    /// Returns error if HTTP client cannot be created.
    pub fn new(
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
        region: impl Into<String>,
    ) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            region: region.into(),
            endpoint: None,
        })
    }

    /// Send requests to a different endpoint.
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into().trim_end_matches('/').to_string());
        self
    }

    /// Get EC2 API endpoint.
    fn ec2_endpoint(&self) -> String {
        self.endpoint
            .clone()
            .unwrap_or_else(|| format!("https://ec2.{}.amazonaws.com", self.region))
    }

    /// Execute one API action.
    async fn action(&self, operation: &str, params: Value) -> Result<Value, RemoteError> {
        let url = format!(
            "{}/?Action={operation}&Version={API_VERSION}",
            self.ec2_endpoint()
        );
        debug!(url = %url, operation, "EC2 request");

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header(
                "X-Amz-Date",
                chrono::Utc::now().format("%Y%m%dT%H%M%SZ").to_string(),
            )
            .header("X-Amz-Access-Key-Id", &self.access_key_id)
            .json(&params)
            .send()
            .await?;

        Self::handle_response(operation, response).await
    }

    /// Handle API response.
    async fn handle_response(
        operation: &str,
        response: reqwest::Response,
    ) -> Result<Value, RemoteError> {
        let status = response.status();
        let text = response.text().await?;

        if status.is_success() {
            if text.trim().is_empty() {
                return Ok(Value::Null);
            }
            return serde_json::from_str(&text).map_err(|e| {
                warn!(operation, error = %e, body = %text, "Failed to parse response");
                RemoteError::Serialization(e)
            });
        }

        let error = serde_json::from_str::<Value>(&text)
            .ok()
            .and_then(|body| body.get("Error").cloned());
        if let Some(code) = error
            .as_ref()
            .and_then(|e| e.get("Code"))
            .and_then(Value::as_str)
        {
            let message = error
                .as_ref()
                .and_then(|e| e.get("Message"))
                .and_then(Value::as_str)
                .unwrap_or_default();
            return Err(RemoteError::from_code(code, message));
        }

        Err(match status {
            StatusCode::TOO_MANY_REQUESTS => RemoteError::Throttled {
                code: "Throttling".to_string(),
                message: text,
            },
            StatusCode::NOT_FOUND => RemoteError::NotFound {
                code: "NotFound".to_string(),
                message: text,
            },
            _ => RemoteError::Api {
                code: status.as_u16().to_string(),
                message: text,
            },
        })
    }

    /// Decode a required response field.
    fn field<T: DeserializeOwned>(response: &Value, key: &str) -> Result<T, RemoteError> {
        let value = response.get(key).cloned().unwrap_or(Value::Null);
        Ok(serde_json::from_value(value)?)
    }

    /// Decode a list field; a missing list is empty.
    fn list<T: DeserializeOwned>(response: &Value, key: &str) -> Result<Vec<T>, RemoteError> {
        match response.get(key) {
            Some(value) => Ok(serde_json::from_value(value.clone())?),
            None => Ok(Vec::new()),
        }
    }

    /// Run a paginated describe action.
    async fn describe_page<T: DeserializeOwned>(
        &self,
        operation: &str,
        key: &str,
        filters: &[Filter],
        next_token: Option<String>,
    ) -> Result<Page<T>, RemoteError> {
        let mut params = json!({ "Filters": filters });
        if let Some(token) = next_token {
            params["NextToken"] = Value::String(token);
        }

        let response = self.action(operation, params).await?;
        Ok(Page {
            items: Self::list(&response, key)?,
            next_token: response
                .get("NextToken")
                .and_then(Value::as_str)
                .filter(|t| !t.is_empty())
                .map(str::to_string),
        })
    }

    /// Run an unpaginated describe action.
    async fn describe_all<T: DeserializeOwned>(
        &self,
        operation: &str,
        key: &str,
        filters: &[Filter],
    ) -> Result<Vec<T>, RemoteError> {
        let response = self.action(operation, json!({ "Filters": filters })).await?;
        Self::list(&response, key)
    }
}

#[async_trait]
impl Ec2Api for HttpEc2 {
    // ========================================================================
    // Regions, VPCs and tags
    // ========================================================================

    async fn describe_availability_zones(&self) -> Result<Vec<String>, RemoteError> {
        let response = self
            .action(
                "DescribeAvailabilityZones",
                json!({ "Filters": [Filter::new("state", ["available"])] }),
            )
            .await?;

        Ok(response
            .get("AvailabilityZones")
            .and_then(Value::as_array)
            .map(|zones| {
                zones
                    .iter()
                    .filter_map(|z| z.get("ZoneName").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn describe_vpcs(
        &self,
        filters: &[Filter],
        next_token: Option<String>,
    ) -> Result<Page<Vpc>, RemoteError> {
        self.describe_page("DescribeVpcs", "Vpcs", filters, next_token)
            .await
    }

    async fn create_vpc(&self, cidr_block: &str) -> Result<Vpc, RemoteError> {
        let response = self
            .action("CreateVpc", json!({ "CidrBlock": cidr_block }))
            .await?;
        Self::field(&response, "Vpc")
    }

    async fn modify_vpc_attribute(
        &self,
        vpc_id: &str,
        attribute: VpcAttribute,
        value: bool,
    ) -> Result<(), RemoteError> {
        let attribute = serde_json::to_value(attribute)?;
        let mut params = json!({ "VpcId": vpc_id });
        if let Some(name) = attribute.as_str() {
            params[name] = json!({ "Value": value });
        }
        self.action("ModifyVpcAttribute", params).await?;
        Ok(())
    }

    async fn delete_vpc(&self, vpc_id: &str) -> Result<(), RemoteError> {
        self.action("DeleteVpc", json!({ "VpcId": vpc_id })).await?;
        Ok(())
    }

    async fn create_tags(&self, resource_ids: &[String], tags: &[Tag]) -> Result<(), RemoteError> {
        self.action(
            "CreateTags",
            json!({ "Resources": resource_ids, "Tags": tags }),
        )
        .await?;
        Ok(())
    }

    // ========================================================================
    // Subnets and route tables
    // ========================================================================

    async fn describe_subnets(
        &self,
        filters: &[Filter],
        next_token: Option<String>,
    ) -> Result<Page<Subnet>, RemoteError> {
        self.describe_page("DescribeSubnets", "Subnets", filters, next_token)
            .await
    }

    async fn create_subnet(
        &self,
        vpc_id: &str,
        cidr_block: &str,
        availability_zone: &str,
    ) -> Result<Subnet, RemoteError> {
        let response = self
            .action(
                "CreateSubnet",
                json!({
                    "VpcId": vpc_id,
                    "CidrBlock": cidr_block,
                    "AvailabilityZone": availability_zone,
                }),
            )
            .await?;
        Self::field(&response, "Subnet")
    }

    async fn delete_subnet(&self, subnet_id: &str) -> Result<(), RemoteError> {
        self.action("DeleteSubnet", json!({ "SubnetId": subnet_id }))
            .await?;
        Ok(())
    }

    async fn describe_route_tables(
        &self,
        filters: &[Filter],
        next_token: Option<String>,
    ) -> Result<Page<RouteTable>, RemoteError> {
        self.describe_page("DescribeRouteTables", "RouteTables", filters, next_token)
            .await
    }

    async fn create_route_table(&self, vpc_id: &str) -> Result<RouteTable, RemoteError> {
        let response = self
            .action("CreateRouteTable", json!({ "VpcId": vpc_id }))
            .await?;
        Self::field(&response, "RouteTable")
    }

    async fn delete_route_table(&self, route_table_id: &str) -> Result<(), RemoteError> {
        self.action("DeleteRouteTable", json!({ "RouteTableId": route_table_id }))
            .await?;
        Ok(())
    }

    async fn associate_route_table(
        &self,
        route_table_id: &str,
        subnet_id: &str,
    ) -> Result<String, RemoteError> {
        let response = self
            .action(
                "AssociateRouteTable",
                json!({ "RouteTableId": route_table_id, "SubnetId": subnet_id }),
            )
            .await?;
        Self::field(&response, "AssociationId")
    }

    async fn disassociate_route_table(&self, association_id: &str) -> Result<(), RemoteError> {
        self.action(
            "DisassociateRouteTable",
            json!({ "AssociationId": association_id }),
        )
        .await?;
        Ok(())
    }

    async fn replace_route_table_association(
        &self,
        association_id: &str,
        route_table_id: &str,
    ) -> Result<String, RemoteError> {
        let response = self
            .action(
                "ReplaceRouteTableAssociation",
                json!({ "AssociationId": association_id, "RouteTableId": route_table_id }),
            )
            .await?;
        Self::field(&response, "NewAssociationId")
    }

    async fn create_route(&self, route_table_id: &str, route: &Route) -> Result<(), RemoteError> {
        let mut params = serde_json::to_value(route)?;
        params["RouteTableId"] = json!(route_table_id);
        self.action("CreateRoute", params).await?;
        Ok(())
    }

    async fn replace_route(&self, route_table_id: &str, route: &Route) -> Result<(), RemoteError> {
        let mut params = serde_json::to_value(route)?;
        params["RouteTableId"] = json!(route_table_id);
        self.action("ReplaceRoute", params).await?;
        Ok(())
    }

    async fn delete_route(
        &self,
        route_table_id: &str,
        destination_cidr_block: &str,
    ) -> Result<(), RemoteError> {
        self.action(
            "DeleteRoute",
            json!({
                "RouteTableId": route_table_id,
                "DestinationCidrBlock": destination_cidr_block,
            }),
        )
        .await?;
        Ok(())
    }

    // ========================================================================
    // NAT gateways and elastic addresses
    // ========================================================================

    async fn describe_nat_gateways(
        &self,
        filters: &[Filter],
        next_token: Option<String>,
    ) -> Result<Page<NatGateway>, RemoteError> {
        self.describe_page("DescribeNatGateways", "NatGateways", filters, next_token)
            .await
    }

    async fn create_nat_gateway(
        &self,
        subnet_id: &str,
        allocation_id: &str,
        client_token: &str,
    ) -> Result<NatGateway, RemoteError> {
        let response = self
            .action(
                "CreateNatGateway",
                json!({
                    "SubnetId": subnet_id,
                    "AllocationId": allocation_id,
                    "ClientToken": client_token,
                }),
            )
            .await?;
        Self::field(&response, "NatGateway")
    }

    async fn delete_nat_gateway(&self, nat_gateway_id: &str) -> Result<(), RemoteError> {
        self.action("DeleteNatGateway", json!({ "NatGatewayId": nat_gateway_id }))
            .await?;
        Ok(())
    }

    async fn describe_addresses(&self, filters: &[Filter]) -> Result<Vec<Address>, RemoteError> {
        self.describe_all("DescribeAddresses", "Addresses", filters)
            .await
    }

    async fn allocate_address(&self) -> Result<Address, RemoteError> {
        let response = self
            .action("AllocateAddress", json!({ "Domain": "vpc" }))
            .await?;
        Ok(Address {
            allocation_id: Self::field(&response, "AllocationId")?,
            public_ip: Self::field(&response, "PublicIp")?,
            association_id: None,
            tags: Vec::new(),
        })
    }

    async fn release_address(&self, allocation_id: &str) -> Result<(), RemoteError> {
        self.action("ReleaseAddress", json!({ "AllocationId": allocation_id }))
            .await?;
        Ok(())
    }

    // ========================================================================
    // Security groups and network interfaces
    // ========================================================================

    async fn describe_security_groups(
        &self,
        filters: &[Filter],
        next_token: Option<String>,
    ) -> Result<Page<SecurityGroup>, RemoteError> {
        self.describe_page(
            "DescribeSecurityGroups",
            "SecurityGroups",
            filters,
            next_token,
        )
        .await
    }

    async fn create_security_group(
        &self,
        vpc_id: &str,
        group_name: &str,
        description: &str,
    ) -> Result<SecurityGroup, RemoteError> {
        let response = self
            .action(
                "CreateSecurityGroup",
                json!({
                    "VpcId": vpc_id,
                    "GroupName": group_name,
                    "Description": description,
                }),
            )
            .await?;
        Ok(SecurityGroup {
            group_id: Self::field(&response, "GroupId")?,
            group_name: group_name.to_string(),
            vpc_id: vpc_id.to_string(),
            description: description.to_string(),
            ingress_rules: Vec::new(),
            tags: Vec::new(),
        })
    }

    async fn delete_security_group(&self, group_id: &str) -> Result<(), RemoteError> {
        self.action("DeleteSecurityGroup", json!({ "GroupId": group_id }))
            .await?;
        Ok(())
    }

    async fn authorize_ingress(
        &self,
        group_id: &str,
        rules: &[SecurityRule],
    ) -> Result<(), RemoteError> {
        self.action(
            "AuthorizeSecurityGroupIngress",
            json!({ "GroupId": group_id, "IpPermissions": rules }),
        )
        .await?;
        Ok(())
    }

    async fn revoke_ingress(
        &self,
        group_id: &str,
        rules: &[SecurityRule],
    ) -> Result<(), RemoteError> {
        self.action(
            "RevokeSecurityGroupIngress",
            json!({ "GroupId": group_id, "IpPermissions": rules }),
        )
        .await?;
        Ok(())
    }

    async fn describe_network_interfaces(
        &self,
        filters: &[Filter],
        next_token: Option<String>,
    ) -> Result<Page<NetworkInterface>, RemoteError> {
        self.describe_page(
            "DescribeNetworkInterfaces",
            "NetworkInterfaces",
            filters,
            next_token,
        )
        .await
    }

    async fn create_network_interface(
        &self,
        subnet_id: &str,
        private_ip_address: &str,
        description: &str,
    ) -> Result<NetworkInterface, RemoteError> {
        let response = self
            .action(
                "CreateNetworkInterface",
                json!({
                    "SubnetId": subnet_id,
                    "PrivateIpAddress": private_ip_address,
                    "Description": description,
                }),
            )
            .await?;
        Self::field(&response, "NetworkInterface")
    }

    async fn detach_network_interface(&self, attachment_id: &str) -> Result<(), RemoteError> {
        self.action(
            "DetachNetworkInterface",
            json!({ "AttachmentId": attachment_id, "Force": true }),
        )
        .await?;
        Ok(())
    }

    async fn delete_network_interface(
        &self,
        network_interface_id: &str,
    ) -> Result<(), RemoteError> {
        self.action(
            "DeleteNetworkInterface",
            json!({ "NetworkInterfaceId": network_interface_id }),
        )
        .await?;
        Ok(())
    }

    // ========================================================================
    // Internet and VPN gateways
    // ========================================================================

    async fn describe_internet_gateways(
        &self,
        filters: &[Filter],
    ) -> Result<Vec<InternetGateway>, RemoteError> {
        self.describe_all("DescribeInternetGateways", "InternetGateways", filters)
            .await
    }

    async fn create_internet_gateway(&self) -> Result<InternetGateway, RemoteError> {
        let response = self.action("CreateInternetGateway", json!({})).await?;
        Self::field(&response, "InternetGateway")
    }

    async fn attach_internet_gateway(
        &self,
        gateway_id: &str,
        vpc_id: &str,
    ) -> Result<(), RemoteError> {
        self.action(
            "AttachInternetGateway",
            json!({ "InternetGatewayId": gateway_id, "VpcId": vpc_id }),
        )
        .await?;
        Ok(())
    }

    async fn detach_internet_gateway(
        &self,
        gateway_id: &str,
        vpc_id: &str,
    ) -> Result<(), RemoteError> {
        self.action(
            "DetachInternetGateway",
            json!({ "InternetGatewayId": gateway_id, "VpcId": vpc_id }),
        )
        .await?;
        Ok(())
    }

    async fn delete_internet_gateway(&self, gateway_id: &str) -> Result<(), RemoteError> {
        self.action(
            "DeleteInternetGateway",
            json!({ "InternetGatewayId": gateway_id }),
        )
        .await?;
        Ok(())
    }

    async fn describe_vpn_gateways(
        &self,
        filters: &[Filter],
    ) -> Result<Vec<VpnGateway>, RemoteError> {
        self.describe_all("DescribeVpnGateways", "VpnGateways", filters)
            .await
    }

    async fn attach_vpn_gateway(&self, gateway_id: &str, vpc_id: &str) -> Result<(), RemoteError> {
        self.action(
            "AttachVpnGateway",
            json!({ "VpnGatewayId": gateway_id, "VpcId": vpc_id }),
        )
        .await?;
        Ok(())
    }

    async fn detach_vpn_gateway(&self, gateway_id: &str, vpc_id: &str) -> Result<(), RemoteError> {
        self.action(
            "DetachVpnGateway",
            json!({ "VpnGatewayId": gateway_id, "VpcId": vpc_id }),
        )
        .await?;
        Ok(())
    }

    // ========================================================================
    // Peering connections
    // ========================================================================

    async fn describe_vpc_peering_connections(
        &self,
        filters: &[Filter],
        next_token: Option<String>,
    ) -> Result<Page<VpcPeering>, RemoteError> {
        self.describe_page(
            "DescribeVpcPeeringConnections",
            "VpcPeeringConnections",
            filters,
            next_token,
        )
        .await
    }

    async fn create_vpc_peering_connection(
        &self,
        requester_vpc_id: &str,
        accepter_vpc_id: &str,
    ) -> Result<VpcPeering, RemoteError> {
        let response = self
            .action(
                "CreateVpcPeeringConnection",
                json!({ "VpcId": requester_vpc_id, "PeerVpcId": accepter_vpc_id }),
            )
            .await?;
        Self::field(&response, "VpcPeeringConnection")
    }

    async fn accept_vpc_peering_connection(&self, peering_id: &str) -> Result<(), RemoteError> {
        self.action(
            "AcceptVpcPeeringConnection",
            json!({ "VpcPeeringConnectionId": peering_id }),
        )
        .await?;
        Ok(())
    }

    async fn delete_vpc_peering_connection(&self, peering_id: &str) -> Result<(), RemoteError> {
        self.action(
            "DeleteVpcPeeringConnection",
            json!({ "VpcPeeringConnectionId": peering_id }),
        )
        .await?;
        Ok(())
    }

    // ========================================================================
    // DHCP option sets
    // ========================================================================

    async fn describe_dhcp_options(
        &self,
        filters: &[Filter],
    ) -> Result<Vec<DhcpOptions>, RemoteError> {
        self.describe_all("DescribeDhcpOptions", "DhcpOptions", filters)
            .await
    }

    async fn create_dhcp_options(
        &self,
        configurations: &[DhcpConfiguration],
    ) -> Result<DhcpOptions, RemoteError> {
        let response = self
            .action(
                "CreateDhcpOptions",
                json!({ "DhcpConfigurations": configurations }),
            )
            .await?;
        Self::field(&response, "DhcpOptions")
    }

    async fn associate_dhcp_options(
        &self,
        dhcp_options_id: &str,
        vpc_id: &str,
    ) -> Result<(), RemoteError> {
        self.action(
            "AssociateDhcpOptions",
            json!({ "DhcpOptionsId": dhcp_options_id, "VpcId": vpc_id }),
        )
        .await?;
        Ok(())
    }

    async fn delete_dhcp_options(&self, dhcp_options_id: &str) -> Result<(), RemoteError> {
        self.action(
            "DeleteDhcpOptions",
            json!({ "DhcpOptionsId": dhcp_options_id }),
        )
        .await?;
        Ok(())
    }
}
